use common::{
    natural_id, EpisodePlay, ExternalEpisodeAction, ExternalSubscription, FeedEpisode,
    FeedMetadata, PodcastEpisode, PodcastSubscription,
};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::playback::{append_play, play_prefix};
use crate::{
    decode_id, decode_value, encode_value, join_key, now_secs, prefix_end, prefix_key, Catalog,
    CatalogError, EPISODES_BY_SUBSCRIPTION_TABLE, EPISODES_TABLE, META_TABLE, PLAYS_TABLE,
    SUBSCRIPTIONS_BY_EXTERNAL_TABLE, SUBSCRIPTIONS_BY_USER_TABLE, SUBSCRIPTIONS_TABLE,
};

const IMPORTED_ACTION_DEVICE: &str = "gpodder";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpisodeStoreReport {
    pub inserted: usize,
    pub updated: usize,
    pub ignored: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionImportReport {
    pub imported: usize,
    pub duplicates: usize,
    pub unknown: usize,
}

pub fn subscription_id(user_id: &str, url: &str) -> String {
    natural_id(&[user_id, url])
}

pub fn episode_id(user_id: &str, guid: &str) -> String {
    natural_id(&[user_id, guid])
}

impl Catalog {
    pub fn get_subscription(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<PodcastSubscription>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SUBSCRIPTIONS_TABLE)?;
        let subscription: Option<PodcastSubscription> = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(subscription.filter(|sub| sub.user_id == user_id))
    }

    pub fn list_subscriptions(
        &self,
        user_id: &str,
    ) -> Result<Vec<PodcastSubscription>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(SUBSCRIPTIONS_BY_USER_TABLE)?;
        let table = read_txn.open_table(SUBSCRIPTIONS_TABLE)?;

        let prefix = prefix_key(user_id);
        let end = prefix_end(&prefix);
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let id = decode_id(entry.1.value())?;
            if let Some(value) = table.get(id.as_str())? {
                let subscription: PodcastSubscription = decode_value(value.value())?;
                items.push(subscription);
            }
        }
        items.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
        Ok(items)
    }

    /// Subscribed feeds of every user, for batch refreshes.
    pub fn all_active_subscriptions(&self) -> Result<Vec<PodcastSubscription>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SUBSCRIPTIONS_TABLE)?;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let subscription: PodcastSubscription = decode_value(entry.1.value())?;
            if subscription.subscribed {
                items.push(subscription);
            }
        }
        Ok(items)
    }

    pub fn subscriptions_missing_metadata(
        &self,
    ) -> Result<Vec<PodcastSubscription>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SUBSCRIPTIONS_TABLE)?;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let subscription: PodcastSubscription = decode_value(entry.1.value())?;
            if !subscription.metadata_fetched {
                items.push(subscription);
            }
        }
        Ok(items)
    }

    /// Upserts by (user, url). Returns the row and whether it was created.
    ///
    /// An existing row is re-marked subscribed and touched; its metadata is
    /// left for the next feed refresh.
    pub fn subscribe(
        &self,
        user_id: &str,
        url: &str,
        metadata: Option<&FeedMetadata>,
        image: Option<String>,
    ) -> Result<(PodcastSubscription, bool), CatalogError> {
        let id = subscription_id(user_id, url);
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(SUBSCRIPTIONS_TABLE)?;
            let mut index = write_txn.open_table(SUBSCRIPTIONS_BY_USER_TABLE)?;
            let existing: Option<PodcastSubscription> = match table.get(id.as_str())? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            let (subscription, created) = match existing {
                Some(mut subscription) => {
                    subscription.subscribed = true;
                    subscription.updated = now_secs();
                    (subscription, false)
                }
                None => {
                    let mut subscription = new_subscription(&id, user_id, url, None);
                    if let Some(metadata) = metadata {
                        apply_metadata(&mut subscription, metadata, image);
                    }
                    (subscription, true)
                }
            };
            let bytes = encode_value(&subscription)?;
            table.insert(id.as_str(), bytes.as_slice())?;
            let index_key = join_key(&[user_id, &id]);
            index.insert(index_key.as_str(), id.as_bytes())?;
            (subscription, created)
        };
        write_txn.commit()?;
        Ok(result)
    }

    pub fn unsubscribe(&self, user_id: &str, id: &str) -> Result<bool, CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SUBSCRIPTIONS_TABLE)?;
            let mut subscription: PodcastSubscription = match table.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(false),
            };
            if subscription.user_id != user_id {
                return Ok(false);
            }
            subscription.subscribed = false;
            subscription.updated = now_secs();
            let bytes = encode_value(&subscription)?;
            table.insert(id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Applies fetched channel metadata. A locally set image and the
    /// subscribed flag are left alone.
    pub fn apply_subscription_metadata(
        &self,
        user_id: &str,
        id: &str,
        metadata: &FeedMetadata,
        image: Option<String>,
    ) -> Result<Option<PodcastSubscription>, CatalogError> {
        let write_txn = self.db.begin_write()?;
        let subscription = {
            let mut table = write_txn.open_table(SUBSCRIPTIONS_TABLE)?;
            let mut subscription: PodcastSubscription = match table.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(None),
            };
            if subscription.user_id != user_id {
                return Ok(None);
            }
            apply_metadata(&mut subscription, metadata, image);
            let bytes = encode_value(&subscription)?;
            table.insert(id, bytes.as_slice())?;
            subscription
        };
        write_txn.commit()?;
        Ok(Some(subscription))
    }

    pub fn store_episodes(
        &self,
        user_id: &str,
        subscription_id: &str,
        episodes: &[FeedEpisode],
    ) -> Result<usize, CatalogError> {
        let report = self.store_episodes_report(user_id, subscription_id, episodes)?;
        Ok(report.inserted + report.updated)
    }

    /// Upserts feed items by (user, guid). Existing episodes keep their id and
    /// subscription link; items without a GUID are ignored.
    pub fn store_episodes_report(
        &self,
        user_id: &str,
        subscription_id: &str,
        episodes: &[FeedEpisode],
    ) -> Result<EpisodeStoreReport, CatalogError> {
        let mut report = EpisodeStoreReport::default();
        let write_txn = self.db.begin_write()?;
        {
            let subscriptions = write_txn.open_table(SUBSCRIPTIONS_TABLE)?;
            let owned = match subscriptions.get(subscription_id)? {
                Some(value) => {
                    let subscription: PodcastSubscription = decode_value(value.value())?;
                    subscription.user_id == user_id
                }
                None => false,
            };
            if !owned {
                return Err(CatalogError::NotFound(format!(
                    "subscription {}",
                    subscription_id
                )));
            }

            let mut table = write_txn.open_table(EPISODES_TABLE)?;
            let mut index = write_txn.open_table(EPISODES_BY_SUBSCRIPTION_TABLE)?;
            for item in episodes {
                let guid = item.guid.trim();
                if guid.is_empty() {
                    report.ignored += 1;
                    continue;
                }
                let id = episode_id(user_id, guid);
                let existing: Option<PodcastEpisode> = match table.get(id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                let episode = match existing {
                    Some(mut episode) => {
                        episode.title = item.title.clone();
                        episode.pub_date = item.pub_date;
                        episode.duration_secs = item.duration_secs;
                        episode.media_url = item.media_url.clone();
                        episode.description = item.description.clone();
                        report.updated += 1;
                        episode
                    }
                    None => {
                        report.inserted += 1;
                        let episode = PodcastEpisode {
                            id: id.clone(),
                            user_id: user_id.to_string(),
                            subscription_id: subscription_id.to_string(),
                            guid: guid.to_string(),
                            title: item.title.clone(),
                            pub_date: item.pub_date,
                            duration_secs: item.duration_secs,
                            media_url: item.media_url.clone(),
                            description: item.description.clone(),
                        };
                        let index_key = join_key(&[user_id, subscription_id, guid]);
                        index.insert(index_key.as_str(), id.as_bytes())?;
                        episode
                    }
                };
                let bytes = encode_value(&episode)?;
                table.insert(id.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        debug!(
            "Stored episodes for {}/{}: {} new, {} updated, {} without guid",
            user_id, subscription_id, report.inserted, report.updated, report.ignored
        );
        Ok(report)
    }

    pub fn get_episode(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<PodcastEpisode>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EPISODES_TABLE)?;
        let episode: Option<PodcastEpisode> = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(episode.filter(|episode| episode.user_id == user_id))
    }

    /// Episodes of one subscription, newest first.
    pub fn list_episodes(
        &self,
        user_id: &str,
        subscription_id: &str,
    ) -> Result<Vec<PodcastEpisode>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(EPISODES_BY_SUBSCRIPTION_TABLE)?;
        let table = read_txn.open_table(EPISODES_TABLE)?;

        let prefix = prefix_key(&join_key(&[user_id, subscription_id]));
        let end = prefix_end(&prefix);
        let mut items = Vec::new();
        for entry in index.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let id = decode_id(entry.1.value())?;
            if let Some(value) = table.get(id.as_str())? {
                let episode: PodcastEpisode = decode_value(value.value())?;
                items.push(episode);
            }
        }
        items.sort_by(|a, b| b.pub_date.cmp(&a.pub_date).then_with(|| a.guid.cmp(&b.guid)));
        Ok(items)
    }

    /// Creates local rows for external subscriptions not linked yet. A record
    /// whose URL already has a local row is linked to it instead. Returns the
    /// newly created rows, which still need their metadata fetched.
    pub fn import_external_subscriptions(
        &self,
        user_id: &str,
        records: &[ExternalSubscription],
    ) -> Result<Vec<PodcastSubscription>, CatalogError> {
        let mut created = Vec::new();
        let mut linked = 0usize;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SUBSCRIPTIONS_TABLE)?;
            let mut by_user = write_txn.open_table(SUBSCRIPTIONS_BY_USER_TABLE)?;
            let mut by_external = write_txn.open_table(SUBSCRIPTIONS_BY_EXTERNAL_TABLE)?;
            for record in records {
                let url = record.url.trim();
                if url.is_empty() || record.external_id.is_empty() {
                    continue;
                }
                let external_key = join_key(&[user_id, &record.external_id]);
                if by_external.get(external_key.as_str())?.is_some() {
                    continue;
                }

                let id = subscription_id(user_id, url);
                let existing: Option<PodcastSubscription> = match table.get(id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                let subscription = match existing {
                    Some(mut subscription) => {
                        subscription.external_id = Some(record.external_id.clone());
                        linked += 1;
                        subscription
                    }
                    None => {
                        let subscription = new_subscription(
                            &id,
                            user_id,
                            url,
                            Some(record.external_id.clone()),
                        );
                        created.push(subscription.clone());
                        subscription
                    }
                };
                let bytes = encode_value(&subscription)?;
                table.insert(id.as_str(), bytes.as_slice())?;
                let user_key = join_key(&[user_id, &id]);
                by_user.insert(user_key.as_str(), id.as_bytes())?;
                by_external.insert(external_key.as_str(), id.as_bytes())?;
            }
        }
        write_txn.commit()?;
        info!(
            "Imported subscriptions for {}: {} new, {} linked",
            user_id,
            created.len(),
            linked
        );
        Ok(created)
    }

    /// Appends external play actions, resolving episodes by GUID. Actions for
    /// unknown episodes and repeats of (user, guid, timestamp) are skipped.
    pub fn import_external_actions(
        &self,
        user_id: &str,
        actions: &[ExternalEpisodeAction],
    ) -> Result<ActionImportReport, CatalogError> {
        let mut report = ActionImportReport::default();
        let write_txn = self.db.begin_write()?;
        {
            let episodes = write_txn.open_table(EPISODES_TABLE)?;
            let mut plays = write_txn.open_table(PLAYS_TABLE)?;
            let mut meta = write_txn.open_table(META_TABLE)?;
            for action in actions {
                let guid = action.guid.trim();
                let id = episode_id(user_id, guid);
                let episode: Option<PodcastEpisode> = match episodes.get(id.as_str())? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                if episode.is_none() || guid.is_empty() {
                    warn!("No episode with guid {:?} for {}; skipping action", guid, user_id);
                    report.unknown += 1;
                    continue;
                }
                if play_exists_at(&plays, user_id, guid, action.timestamp)? {
                    report.duplicates += 1;
                    continue;
                }
                let play = EpisodePlay {
                    user_id: user_id.to_string(),
                    episode_id: id,
                    guid: guid.to_string(),
                    action: action.action,
                    timestamp: action.timestamp,
                    position: action.position,
                    total: action.total,
                    device: Some(
                        action
                            .device
                            .clone()
                            .filter(|device| !device.is_empty())
                            .unwrap_or_else(|| IMPORTED_ACTION_DEVICE.to_string()),
                    ),
                };
                append_play(&mut plays, &mut meta, &play)?;
                report.imported += 1;
            }
        }
        write_txn.commit()?;
        info!(
            "Imported episode actions for {}: {} new, {} duplicate, {} unknown",
            user_id, report.imported, report.duplicates, report.unknown
        );
        Ok(report)
    }
}

fn play_exists_at(
    plays: &impl ReadableTable<&'static str, &'static [u8]>,
    user_id: &str,
    guid: &str,
    timestamp: u64,
) -> Result<bool, CatalogError> {
    let prefix = prefix_key(&format!("{}{:020}", play_prefix(user_id, guid), timestamp));
    let end = prefix_end(&prefix);
    let mut range = plays.range(prefix.as_str()..end.as_str())?;
    Ok(range.next().is_some())
}

fn new_subscription(
    id: &str,
    user_id: &str,
    url: &str,
    external_id: Option<String>,
) -> PodcastSubscription {
    PodcastSubscription {
        id: id.to_string(),
        user_id: user_id.to_string(),
        url: url.to_string(),
        external_id,
        title: String::new(),
        author: String::new(),
        description: String::new(),
        link: String::new(),
        image: None,
        subscribed: true,
        updated: now_secs(),
        metadata_fetched: false,
    }
}

fn apply_metadata(
    subscription: &mut PodcastSubscription,
    metadata: &FeedMetadata,
    image: Option<String>,
) {
    subscription.title = metadata.title.clone();
    subscription.author = metadata.author.clone();
    subscription.description = metadata.description.clone();
    subscription.link = metadata.link.clone();
    let has_image = subscription
        .image
        .as_ref()
        .map(|value| !value.is_empty())
        .unwrap_or(false);
    if !has_image {
        subscription.image = image;
    }
    subscription.metadata_fetched = true;
    subscription.updated = now_secs();
}
