use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{LocaleListProvider, LocaleQuery, ProviderError};
use crate::capabilities::{HttpError, HttpRequest, HttpTransport, ValidatedUrl};
use crate::coordinator::AbortSignal;
use crate::model::LocalePage;

const LIST_TIMEOUT: Duration = Duration::from_secs(15);

/// `GET {base}/locales` against the app backend.
pub struct HttpLocaleListProvider {
    transport: Arc<dyn HttpTransport>,
    endpoint: ValidatedUrl,
    auth_token: Option<SecretString>,
}

impl HttpLocaleListProvider {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: &str) -> Result<Self, ProviderError> {
        let endpoint = ValidatedUrl::new(format!("{}/locales", base_url.trim_end_matches('/')))?;
        Ok(Self {
            transport,
            endpoint,
            auth_token: None,
        })
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: SecretString) -> Self {
        self.auth_token = Some(token);
        self
    }

    fn build_request(&self, query: &LocaleQuery) -> Result<HttpRequest, ProviderError> {
        let page = query.page.to_string();
        let page_size = query.page_size.to_string();
        let spot_types = query.spot_types.join(",");

        let mut params: Vec<(&str, &str)> = Vec::with_capacity(7);
        let search = query.search_text.trim();
        if !search.is_empty() {
            params.push(("search", search));
        }
        if let Some(country) = query.country_code.as_deref() {
            params.push(("country", country));
        }
        if let Some(state) = query.state_code.as_deref() {
            params.push(("state", state));
        }
        if !spot_types.is_empty() {
            params.push(("spot_types", spot_types.as_str()));
        }
        params.push(("page", page.as_str()));
        params.push(("page_size", page_size.as_str()));
        params.push((
            "include_inactive",
            if query.include_inactive { "true" } else { "false" },
        ));

        let url = self.endpoint.with_query(params)?;
        let mut request = HttpRequest::get(url)
            .with_header("Accept", "application/json")
            .with_timeout(LIST_TIMEOUT)?;
        if let Some(token) = &self.auth_token {
            request = request.with_header(
                "Authorization",
                format!("Bearer {}", token.expose_secret()),
            );
        }
        Ok(request)
    }
}

#[async_trait::async_trait]
impl LocaleListProvider for HttpLocaleListProvider {
    #[instrument(skip(self, abort), fields(page = query.page))]
    async fn list(
        &self,
        query: &LocaleQuery,
        abort: &AbortSignal,
    ) -> Result<LocalePage, ProviderError> {
        let request = self.build_request(query)?;
        let request_id = request.request_id().to_string();
        debug!(%request_id, "fetching locale page");

        let response = tokio::select! {
            result = self.transport.execute(request) => result?,
            () = abort.aborted() => {
                return Err(HttpError::Cancelled { request_id }.into());
            }
        };

        let page: LocalePage = response.error_for_status()?.json()?;
        Ok(page)
    }
}
