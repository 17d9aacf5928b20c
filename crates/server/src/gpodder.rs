//! Client for the Nextcloud gpoddersync app.

use std::time::Duration;

use common::{ExternalEpisodeAction, ExternalSubscription, PlayAction};
use reqwest::Client;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::GpodderAccount;
use crate::feeds::{validate_url, FeedError};

const SUBSCRIPTIONS_PATH: &str = "/index.php/apps/gpoddersync/subscriptions";
const EPISODE_ACTIONS_PATH: &str = "/index.php/apps/gpoddersync/episode_action";

#[derive(Debug, Default, Deserialize)]
struct SubscriptionChanges {
    #[serde(default)]
    add: Vec<String>,
    #[serde(default)]
    remove: Vec<String>,
}

/// Current subscription state on the gpodder side.
#[derive(Debug, Default)]
pub struct SubscriptionList {
    pub active: Vec<ExternalSubscription>,
    /// Feed URLs the user unsubscribed from.
    pub removed: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EpisodeActionList {
    #[serde(default)]
    actions: Vec<RawEpisodeAction>,
}

#[derive(Debug, Deserialize)]
struct RawEpisodeAction {
    #[serde(default)]
    guid: Option<String>,
    #[serde(default)]
    action: String,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    position: Option<i64>,
    #[serde(default)]
    total: Option<i64>,
    #[serde(default)]
    device: Option<String>,
}

pub struct GpodderClient<'a> {
    client: &'a Client,
    account: &'a GpodderAccount,
    timeout: Duration,
}

impl<'a> GpodderClient<'a> {
    pub fn new(client: &'a Client, account: &'a GpodderAccount, timeout: Duration) -> Self {
        Self {
            client,
            account,
            timeout,
        }
    }

    /// Every subscription known to the source. The URL doubles as the
    /// external id.
    pub async fn subscriptions(&self) -> Result<SubscriptionList, FeedError> {
        let body = self.get(SUBSCRIPTIONS_PATH).await?;
        parse_subscriptions(&body)
    }

    pub async fn episode_actions(&self) -> Result<Vec<ExternalEpisodeAction>, FeedError> {
        let body = self.get(EPISODE_ACTIONS_PATH).await?;
        parse_episode_actions(&body)
    }

    async fn get(&self, path: &str) -> Result<String, FeedError> {
        let base = self.account.base_url.trim_end_matches('/');
        let url = validate_url(&format!("{}{}", base, path))?;
        let response = self
            .client
            .get(url)
            .query(&[("since", "0")])
            .basic_auth(&self.account.username, Some(&self.account.password))
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}

/// A URL present in both lists counts as active.
pub fn parse_subscriptions(body: &str) -> Result<SubscriptionList, FeedError> {
    let changes: SubscriptionChanges =
        serde_json::from_str(body).map_err(|err| FeedError::Parse(err.to_string()))?;
    let active: Vec<ExternalSubscription> = clean_urls(changes.add)
        .map(|url| ExternalSubscription {
            external_id: url.clone(),
            url,
        })
        .collect();
    let removed = clean_urls(changes.remove)
        .filter(|url| !active.iter().any(|sub| &sub.url == url))
        .collect();
    Ok(SubscriptionList { active, removed })
}

fn clean_urls(urls: Vec<String>) -> impl Iterator<Item = String> {
    urls.into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
}

/// Keeps play-type actions that carry a guid and a timestamp. Download and
/// delete actions have no playback meaning and are dropped.
pub fn parse_episode_actions(body: &str) -> Result<Vec<ExternalEpisodeAction>, FeedError> {
    let list: EpisodeActionList =
        serde_json::from_str(body).map_err(|err| FeedError::Parse(err.to_string()))?;
    let mut out = Vec::with_capacity(list.actions.len());
    for raw in list.actions {
        let guid = match raw.guid.as_deref().map(str::trim) {
            Some(guid) if !guid.is_empty() => guid.to_string(),
            _ => continue,
        };
        let action: PlayAction = match raw.action.parse() {
            Ok(action) => action,
            Err(_) => {
                debug!("Skipping gpodder action {:?} for {}", raw.action, guid);
                continue;
            }
        };
        let timestamp = match raw.timestamp.as_ref().and_then(parse_timestamp) {
            Some(timestamp) => timestamp,
            None => continue,
        };
        out.push(ExternalEpisodeAction {
            guid,
            action,
            timestamp,
            position: raw.position.and_then(|value| u64::try_from(value).ok()),
            total: raw.total.and_then(|value| u64::try_from(value).ok()),
            device: raw.device.filter(|device| !device.is_empty()),
        });
    }
    Ok(out)
}

fn parse_timestamp(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(number) => number.as_u64(),
        serde_json::Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(secs) = raw.parse::<u64>() {
                return Some(secs);
            }
            let parsed = OffsetDateTime::parse(raw, &Rfc3339)
                .or_else(|_| OffsetDateTime::parse(&format!("{}Z", raw), &Rfc3339))
                .ok()?;
            u64::try_from(parsed.unix_timestamp()).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ACTIONS: &str = r#"{"actions":[
        {"podcast":"https://f.example.com/a.xml","episode":"https://cdn/1.mp3","guid":"g-1","action":"PLAY","timestamp":"2024-01-01T10:00:00","started":0,"position":120,"total":600},
        {"podcast":"https://f.example.com/a.xml","episode":"https://cdn/2.mp3","guid":"g-2","action":"download","timestamp":"2024-01-01T10:00:00"},
        {"podcast":"https://f.example.com/a.xml","episode":"https://cdn/3.mp3","action":"play","timestamp":"2024-01-01T10:00:00"},
        {"podcast":"https://f.example.com/a.xml","episode":"https://cdn/4.mp3","guid":"g-4","action":"play","timestamp":1704103300,"position":-1,"device":"phone"}
    ],"timestamp":1704103300}"#;

    #[test]
    fn parses_subscription_list() {
        let subs = parse_subscriptions(
            r#"{"add":["https://f.example.com/a.xml"," ",""],"remove":[" https://f.example.com/old.xml","https://f.example.com/a.xml"],"timestamp":1}"#,
        )
        .unwrap();
        assert_eq!(subs.active.len(), 1);
        assert_eq!(subs.active[0].external_id, "https://f.example.com/a.xml");
        assert_eq!(subs.removed, vec!["https://f.example.com/old.xml".to_string()]);
        assert!(matches!(parse_subscriptions("[]"), Err(FeedError::Parse(_))));
    }

    #[test]
    fn keeps_only_play_actions_with_guids() {
        let actions = parse_episode_actions(ACTIONS).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].guid, "g-1");
        assert_eq!(actions[0].action, PlayAction::Play);
        assert_eq!(actions[0].timestamp, 1_704_103_200);
        assert_eq!(actions[0].position, Some(120));
        assert_eq!(actions[1].timestamp, 1_704_103_300);
        assert_eq!(actions[1].position, None);
        assert_eq!(actions[1].device.as_deref(), Some("phone"));
    }

    #[tokio::test]
    async fn fetches_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(SUBSCRIPTIONS_PATH))
            .and(query_param("since", "0"))
            .and(header_exists("authorization"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"add":["https://f.example.com/a.xml"],"remove":[]}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(EPISODE_ACTIONS_PATH))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let account = GpodderAccount {
            base_url: format!("{}/", server.uri()),
            username: "alice".to_string(),
            password: "pw".to_string(),
        };
        let client = Client::new();
        let gpodder = GpodderClient::new(&client, &account, Duration::from_secs(5));
        assert_eq!(gpodder.subscriptions().await.unwrap().active.len(), 1);
        assert!(matches!(
            gpodder.episode_actions().await,
            Err(FeedError::Status(401))
        ));
    }
}
