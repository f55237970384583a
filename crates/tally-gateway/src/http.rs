use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use tracing::{debug, instrument};

use tally_core::gateway::{ItemFinish, ItemStart, LogEntry, ReportingGateway, SessionFinish, SessionStart};
use tally_core::ids::SessionId;
use tally_core::ReportError;
use tally_settings::{ApiToken, Connection};

use crate::wire::{self, EntryCreatedRs, ItemFinishRq, ItemStartRq, LaunchFinishRq, LaunchStartRq};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`ReportingGateway`] over the tracking service's REST API.
///
/// Requests are not retried here; a failed call is reported to the caller,
/// which logs it against the affected item.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    token: ApiToken,
}

impl HttpGateway {
    pub fn new(connection: &Connection) -> Result<Self, ReportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReportError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("{}/api/v1/{}", connection.endpoint, connection.project),
            token: connection.token.clone(),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ReportError> {
        let resp = req
            .bearer_auth(self.token.0.expose_secret())
            .send()
            .await
            .map_err(|e| ReportError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ReportError::from_status(status, body));
        }
        Ok(resp)
    }

    fn multipart_log(entry: &LogEntry) -> Result<Form, ReportError> {
        let json = serde_json::to_string(&wire::log_requests(entry))
            .map_err(|e| ReportError::Transport(format!("encode log request: {e}")))?;
        let mut form = Form::new().part(
            "json_request_part",
            Part::text(json)
                .mime_str("application/json")
                .map_err(|e| ReportError::Transport(e.to_string()))?,
        );
        for attachment in &entry.attachments {
            let part = Part::bytes(attachment.data.clone())
                .file_name(attachment.name.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|e| ReportError::Transport(format!("attachment {}: {e}", attachment.name)))?;
            form = form.part("file", part);
        }
        Ok(form)
    }
}

#[async_trait]
impl ReportingGateway for HttpGateway {
    #[instrument(skip_all, fields(session_id = %start.id))]
    async fn create_session(&self, start: &SessionStart) -> Result<(), ReportError> {
        let req = self.client.post(self.url("launch")).json(&LaunchStartRq::from(start));
        self.send(req).await?;
        debug!("launch created");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %id))]
    async fn finish_session(&self, id: &SessionId, finish: &SessionFinish) -> Result<(), ReportError> {
        let req = self
            .client
            .put(self.url(&format!("launch/{id}/finish")))
            .json(&LaunchFinishRq::from(finish));
        self.send(req).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %start.session_id, name = %start.name))]
    async fn create_item(&self, start: &ItemStart) -> Result<String, ReportError> {
        let path = match &start.parent_remote_id {
            Some(parent) => format!("item/{parent}"),
            None => "item".to_string(),
        };
        let req = self.client.post(self.url(&path)).json(&ItemStartRq::from(start));
        let created: EntryCreatedRs = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(|e| ReportError::Transport(format!("decode item response: {e}")))?;
        if created.id.is_empty() {
            return Err(ReportError::Transport("service returned an empty item id".into()));
        }
        Ok(created.id)
    }

    #[instrument(skip_all, fields(remote_id = %remote_id))]
    async fn finish_item(&self, remote_id: &str, finish: &ItemFinish) -> Result<(), ReportError> {
        let req = self
            .client
            .put(self.url(&format!("item/{remote_id}/finish")))
            .json(&ItemFinishRq::from(finish));
        self.send(req).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(item = %entry.item_remote_id))]
    async fn post_log(&self, entry: &LogEntry) -> Result<(), ReportError> {
        let req = if entry.attachments.is_empty() {
            self.client.post(self.url("log")).json(&wire::log_requests(entry))
        } else {
            self.client.post(self.url("log")).multipart(Self::multipart_log(entry)?)
        };
        self.send(req).await?;
        Ok(())
    }
}
