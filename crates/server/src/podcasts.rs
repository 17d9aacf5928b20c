use catalog::{subscription_id, ActionImportReport};
use common::PodcastSubscription;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::feeds::{self, validate_url};
use crate::gpodder::GpodderClient;
use crate::jobs::{Job, JobError};
use crate::state::AppState;

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct GpodderImportReport {
    pub subscriptions_created: usize,
    pub subscriptions_removed: usize,
    pub episodes_stored: usize,
    pub actions: ActionImportReport,
}

/// Interactive subscribe. A URL the user already has is re-marked subscribed
/// without refetching. New feeds must parse before a row is written; their
/// episodes are fetched by a queued job.
pub async fn subscribe_url(
    state: &AppState,
    user_id: &str,
    url: &str,
) -> Result<(PodcastSubscription, bool), JobError> {
    let url = validate_url(url)?.to_string();
    let id = subscription_id(user_id, &url);
    if state.catalog.get_subscription(user_id, &id)?.is_some() {
        let (subscription, _) = state.catalog.subscribe(user_id, &url, None, None)?;
        return Ok((subscription, false));
    }

    let timeout = state.external_timeout();
    let metadata = match feeds::fetch_subscription_metadata(&state.client, &url, timeout).await {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!("Failed to subscribe {} to {}: {}", user_id, url, err);
            return Err(err.into());
        }
    };
    let image = match metadata.image_url.as_deref() {
        Some(image_url) => feeds::fetch_image_data_uri(&state.client, image_url, timeout).await,
        None => None,
    };
    let (subscription, created) =
        state
            .catalog
            .subscribe(user_id, &url, Some(&metadata), image)?;
    if created {
        info!("{} subscribed to {} ({})", user_id, subscription.title, url);
        state.jobs.submit(Job::FetchEpisodes {
            user_id: user_id.to_string(),
            subscription_id: subscription.id.clone(),
        });
    }
    Ok((subscription, created))
}

/// Fetches the feed and upserts its episodes. Returns the number of
/// episodes inserted or updated.
pub async fn refresh_subscription(
    state: &AppState,
    user_id: &str,
    subscription_id: &str,
) -> Result<usize, JobError> {
    let subscription = state
        .catalog
        .get_subscription(user_id, subscription_id)?
        .ok_or_else(|| JobError::NotFound(format!("subscription {}", subscription_id)))?;
    let episodes =
        feeds::fetch_episodes(&state.client, &subscription.url, state.external_timeout()).await?;
    let report = state
        .catalog
        .store_episodes_report(user_id, subscription_id, &episodes)?;
    info!(
        "Refreshed {} for {}: {} new, {} updated",
        subscription.url, user_id, report.inserted, report.updated
    );
    Ok(report.inserted + report.updated)
}

/// Populates channel metadata for a subscription created without it.
pub async fn fetch_metadata(
    state: &AppState,
    user_id: &str,
    subscription_id: &str,
) -> Result<PodcastSubscription, JobError> {
    let subscription = state
        .catalog
        .get_subscription(user_id, subscription_id)?
        .ok_or_else(|| JobError::NotFound(format!("subscription {}", subscription_id)))?;
    let timeout = state.external_timeout();
    let metadata =
        feeds::fetch_subscription_metadata(&state.client, &subscription.url, timeout).await?;
    let image = match (&subscription.image, metadata.image_url.as_deref()) {
        (None, Some(image_url)) => {
            feeds::fetch_image_data_uri(&state.client, image_url, timeout).await
        }
        _ => None,
    };
    state
        .catalog
        .apply_subscription_metadata(user_id, subscription_id, &metadata, image)?
        .ok_or_else(|| JobError::NotFound(format!("subscription {}", subscription_id)))
}

/// Batch metadata fill for every subscription still missing it. Per-feed
/// failures are logged and skipped.
pub async fn fetch_unfetched_metadata(state: &AppState) -> Result<usize, JobError> {
    let pending = state.catalog.subscriptions_missing_metadata()?;
    let mut fetched = 0usize;
    for subscription in pending {
        match fetch_metadata(state, &subscription.user_id, &subscription.id).await {
            Ok(_) => fetched += 1,
            Err(err) => warn!(
                "Metadata fetch failed for {} ({}): {}",
                subscription.url, subscription.user_id, err
            ),
        }
    }
    Ok(fetched)
}

/// Refreshes every active subscription of every user, skipping failures.
pub async fn refresh_all(state: &AppState) -> Result<usize, JobError> {
    let subscriptions = state.catalog.all_active_subscriptions()?;
    info!("Refreshing {} feeds", subscriptions.len());
    let mut stored = 0usize;
    for subscription in subscriptions {
        match refresh_subscription(state, &subscription.user_id, &subscription.id).await {
            Ok(count) => stored += count,
            Err(err) => warn!(
                "Feed refresh failed for {} ({}): {}",
                subscription.url, subscription.user_id, err
            ),
        }
    }
    Ok(stored)
}

/// Pulls subscriptions, then their episodes, then play actions from the
/// user's gpodder account. With `delayed_fetch` the metadata of new
/// subscriptions is left to a background job.
pub async fn import_gpodder(
    state: &AppState,
    user_id: &str,
    delayed_fetch: bool,
) -> Result<GpodderImportReport, JobError> {
    let account = state
        .user_account(user_id)
        .and_then(|user| user.gpodder)
        .ok_or_else(|| JobError::MissingAccount(user_id.to_string()))?;
    let client = GpodderClient::new(&state.client, &account, state.external_timeout());
    let mut report = GpodderImportReport::default();

    let records = client.subscriptions().await?;
    let created = state
        .catalog
        .import_external_subscriptions(user_id, &records.active)?;
    report.subscriptions_created = created.len();
    for url in &records.removed {
        let id = subscription_id(user_id, url);
        let linked = state
            .catalog
            .get_subscription(user_id, &id)?
            .filter(|sub| sub.subscribed && sub.external_id.is_some());
        if linked.is_some() && state.catalog.unsubscribe(user_id, &id)? {
            debug!("Unsubscribed {} for {} after gpodder removal", url, user_id);
            report.subscriptions_removed += 1;
        }
    }
    if delayed_fetch {
        if !created.is_empty() {
            state.jobs.submit(Job::FetchUnfetchedMetadata);
        }
    } else {
        for subscription in &created {
            if let Err(err) = fetch_metadata(state, user_id, &subscription.id).await {
                warn!("Metadata fetch failed for {}: {}", subscription.url, err);
            }
        }
    }

    for subscription in state.catalog.list_subscriptions(user_id)? {
        if subscription.external_id.is_none() || !subscription.subscribed {
            continue;
        }
        match refresh_subscription(state, user_id, &subscription.id).await {
            Ok(count) => report.episodes_stored += count,
            Err(err) => warn!("Episode import failed for {}: {}", subscription.url, err),
        }
    }

    let actions = client.episode_actions().await?;
    report.actions = state.catalog.import_external_actions(user_id, &actions)?;
    info!(
        "gpodder import for {}: {} subscriptions, {} episodes, {} actions",
        user_id, report.subscriptions_created, report.episodes_stored, report.actions.imported
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GpodderAccount, UserAccount};
    use crate::test_support::{test_state, FEED_XML};
    use catalog::episode_id;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn feed_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FEED_XML))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn subscribe_validates_and_is_idempotent() {
        let server = feed_server().await;
        let (_dir, state) = test_state();
        let url = format!("{}/feed.xml", server.uri());

        let (subscription, created) = subscribe_url(&state, "alice", &url).await.unwrap();
        assert!(created);
        assert_eq!(subscription.title, "Test Cast");
        assert!(subscription.metadata_fetched);

        let (again, created) = subscribe_url(&state, "alice", &url).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, subscription.id);

        let err = subscribe_url(&state, "alice", "ftp://nope").await.unwrap_err();
        assert!(matches!(err, JobError::Feed(feeds::FeedError::InvalidUrl(_))));
        let broken = format!("{}/broken.xml", server.uri());
        let err = subscribe_url(&state, "alice", &broken).await.unwrap_err();
        assert!(matches!(err, JobError::Feed(feeds::FeedError::Parse(_))));
        assert_eq!(state.catalog.list_subscriptions("alice").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refreshing_twice_adds_no_rows() {
        let server = feed_server().await;
        let (_dir, state) = test_state();
        let url = format!("{}/feed.xml", server.uri());
        let (subscription, _) = subscribe_url(&state, "alice", &url).await.unwrap();

        assert_eq!(refresh_subscription(&state, "alice", &subscription.id).await.unwrap(), 2);
        assert_eq!(refresh_subscription(&state, "alice", &subscription.id).await.unwrap(), 2);
        assert_eq!(state.catalog.list_episodes("alice", &subscription.id).unwrap().len(), 2);
        assert_eq!(refresh_all(&state).await.unwrap(), 2);

        let err = refresh_subscription(&state, "bob", &subscription.id).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[tokio::test]
    async fn gpodder_import_links_and_dedups() {
        let server = feed_server().await;
        let feed_url = format!("{}/feed.xml", server.uri());
        Mock::given(method("GET"))
            .and(path("/index.php/apps/gpoddersync/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"{{"add":["{}"],"remove":[],"timestamp":1}}"#,
                feed_url
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/index.php/apps/gpoddersync/episode_action"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"actions":[
                    {"guid":"tc-1","action":"play","timestamp":"2024-01-01T10:00:00","position":30,"total":600},
                    {"guid":"missing","action":"play","timestamp":"2024-01-01T10:00:00","position":1}
                ]}"#,
            ))
            .mount(&server)
            .await;

        let (_dir, state) = test_state();
        state.config.write().users.push(UserAccount {
            id: "alice".to_string(),
            token: "t".to_string(),
            gpodder: Some(GpodderAccount {
                base_url: server.uri(),
                username: "alice".to_string(),
                password: "pw".to_string(),
            }),
        });
        let (local, _) = subscribe_url(&state, "alice", &feed_url).await.unwrap();

        let report = import_gpodder(&state, "alice", false).await.unwrap();
        assert_eq!(report.subscriptions_created, 0);
        assert_eq!(report.episodes_stored, 2);
        assert_eq!(report.actions.imported, 1);
        assert_eq!(report.actions.unknown, 1);
        let subscriptions = state.catalog.list_subscriptions("alice").unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].id, local.id);

        let report = import_gpodder(&state, "alice", true).await.unwrap();
        assert_eq!(report.actions.imported, 0);
        assert_eq!(report.actions.duplicates, 1);
        let id = episode_id("alice", "tc-1");
        assert_eq!(state.catalog.position_for("alice", &id), Some(30));

        let err = import_gpodder(&state, "bob", false).await.unwrap_err();
        assert!(matches!(err, JobError::MissingAccount(_)));
    }

    #[tokio::test]
    async fn gpodder_removals_unsubscribe_linked_feeds() {
        let server = feed_server().await;
        let feed_url = format!("{}/feed.xml", server.uri());
        Mock::given(method("GET"))
            .and(path("/index.php/apps/gpoddersync/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"{{"add":["{}"],"remove":[],"timestamp":1}}"#,
                feed_url
            )))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/index.php/apps/gpoddersync/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"{{"add":[],"remove":["{}","https://never.example.com/x.xml"],"timestamp":2}}"#,
                feed_url
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/index.php/apps/gpoddersync/episode_action"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"actions":[]}"#))
            .mount(&server)
            .await;

        let (_dir, state) = test_state();
        state.config.write().users.push(UserAccount {
            id: "alice".to_string(),
            token: "t".to_string(),
            gpodder: Some(GpodderAccount {
                base_url: server.uri(),
                username: "alice".to_string(),
                password: "pw".to_string(),
            }),
        });

        let report = import_gpodder(&state, "alice", false).await.unwrap();
        assert_eq!(report.subscriptions_created, 1);
        assert_eq!(report.subscriptions_removed, 0);
        let id = subscription_id("alice", &feed_url);
        assert!(state.catalog.get_subscription("alice", &id).unwrap().unwrap().subscribed);

        let report = import_gpodder(&state, "alice", false).await.unwrap();
        assert_eq!(report.subscriptions_removed, 1);
        assert_eq!(report.episodes_stored, 0);
        let subscription = state.catalog.get_subscription("alice", &id).unwrap().unwrap();
        assert!(!subscription.subscribed);
        assert_eq!(state.catalog.list_subscriptions("alice").unwrap().len(), 1);
    }
}
