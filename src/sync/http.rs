use std::time::Duration;

use crate::error::NotifyError;

use super::notify::{Notification, NotificationSink};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs each notification as JSON to a push endpoint.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl NotificationSink for HttpNotifier {
    async fn deliver(&self, notification: Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&notification)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        log::debug!(
            "Notification for {} accepted by {}",
            notification.recipient_id,
            self.url
        );
        Ok(())
    }
}
