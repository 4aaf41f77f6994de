use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use realtime::{PushGateway, PushNotification};
use serde::Serialize;
use url::Url;

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts notifications as JSON to an FCM-style HTTP gateway.
pub struct HttpPushGateway {
    client: reqwest::Client,
    endpoint: Url,
    server_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    notification: PushBody<'a>,
    data: PushData<'a>,
}

#[derive(Debug, Serialize)]
struct PushBody<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct PushData<'a> {
    conversation_id: &'a str,
    user_id: i64,
    is_online: bool,
}

impl HttpPushGateway {
    pub fn new(endpoint: Url, server_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .context("failed to build push http client")?;
        Ok(Self {
            client,
            endpoint,
            server_key: server_key.filter(|key| !key.trim().is_empty()),
        })
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, notification: &PushNotification) -> anyhow::Result<()> {
        let payload = PushRequest {
            to: &notification.token,
            notification: PushBody {
                title: &notification.title,
                body: &notification.body,
            },
            data: PushData {
                conversation_id: notification.conversation_id.as_str(),
                user_id: notification.user_id.0,
                is_online: notification.is_online,
            },
        };
        let mut request = self.client.post(self.endpoint.clone()).json(&payload);
        if let Some(key) = &self.server_key {
            request = request.header(AUTHORIZATION, format!("key={key}"));
        }
        request
            .send()
            .await
            .context("push gateway unreachable")?
            .error_for_status()
            .context("push gateway rejected notification")?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
