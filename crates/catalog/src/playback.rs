use common::{EpisodePlay, PlayAction, PodcastEpisode};
use redb::{ReadableTable, Table};
use tracing::warn;

use crate::{
    decode_value, encode_value, join_key, prefix_end, prefix_key, Catalog, CatalogError,
    EPISODES_TABLE, META_PLAY_SEQ_KEY, META_TABLE, PLAYS_TABLE,
};

const MIN_EPISODE_SECS: u64 = 60;
const FINISHED_RATIO: f64 = 0.98;

impl Catalog {
    /// Appends one play event for an episode the user owns.
    #[allow(clippy::too_many_arguments)]
    pub fn record_action(
        &self,
        user_id: &str,
        episode_id: &str,
        action: PlayAction,
        timestamp: u64,
        position: Option<u64>,
        total: Option<u64>,
        device: Option<String>,
    ) -> Result<EpisodePlay, CatalogError> {
        let write_txn = self.db.begin_write()?;
        let play = {
            let episodes = write_txn.open_table(EPISODES_TABLE)?;
            let episode: PodcastEpisode = match episodes.get(episode_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Err(CatalogError::NotFound(format!("episode {}", episode_id))),
            };
            if episode.user_id != user_id {
                return Err(CatalogError::NotFound(format!("episode {}", episode_id)));
            }
            let play = EpisodePlay {
                user_id: user_id.to_string(),
                episode_id: episode.id,
                guid: episode.guid,
                action,
                timestamp,
                position,
                total,
                device,
            };
            let mut plays = write_txn.open_table(PLAYS_TABLE)?;
            let mut meta = write_txn.open_table(META_TABLE)?;
            append_play(&mut plays, &mut meta, &play)?;
            play
        };
        write_txn.commit()?;
        Ok(play)
    }

    /// Latest recorded position for the episode. Lookup failures are logged
    /// and read as "no position".
    pub fn position_for(&self, user_id: &str, episode_id: &str) -> Option<u64> {
        let episode = match self.get_episode(user_id, episode_id) {
            Ok(Some(episode)) => episode,
            Ok(None) => return None,
            Err(err) => {
                warn!("Failed to load episode {} for {}: {}", episode_id, user_id, err);
                return None;
            }
        };
        match self.latest_play(user_id, &episode.guid) {
            Ok(play) => play.and_then(|play| play.position),
            Err(err) => {
                warn!(
                    "Failed to read position of {} for {}: {}",
                    episode.guid, user_id, err
                );
                None
            }
        }
    }

    pub fn latest_play(
        &self,
        user_id: &str,
        guid: &str,
    ) -> Result<Option<EpisodePlay>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let plays = read_txn.open_table(PLAYS_TABLE)?;
        latest_play_in(&plays, user_id, guid)
    }

    /// Every event for the episode, newest first.
    pub fn plays_for_episode(
        &self,
        user_id: &str,
        guid: &str,
    ) -> Result<Vec<EpisodePlay>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let plays = read_txn.open_table(PLAYS_TABLE)?;
        let prefix = play_prefix(user_id, guid);
        let end = prefix_end(&prefix);
        let mut items = Vec::new();
        for entry in plays.range(prefix.as_str()..end.as_str())?.rev() {
            let entry = entry?;
            let play: EpisodePlay = decode_value(entry.1.value())?;
            items.push(play);
        }
        Ok(items)
    }

    /// For each subscribed feed, the oldest episode the user has not finished.
    pub fn next_unfinished_per_subscription(
        &self,
        user_id: &str,
    ) -> Result<Vec<PodcastEpisode>, CatalogError> {
        let subscriptions = self.list_subscriptions(user_id)?;
        let read_txn = self.db.begin_read()?;
        let plays = read_txn.open_table(PLAYS_TABLE)?;

        let mut out = Vec::new();
        for subscription in subscriptions.iter().filter(|sub| sub.subscribed) {
            let episodes = self.list_episodes(user_id, &subscription.id)?;
            let mut positions = Vec::with_capacity(episodes.len());
            for episode in &episodes {
                let position = latest_play_in(&plays, user_id, &episode.guid)?
                    .and_then(|play| play.position);
                positions.push((episode.id.clone(), position));
            }
            let next = select_next_unfinished(episodes, |episode| {
                positions
                    .iter()
                    .find(|(id, _)| id == &episode.id)
                    .and_then(|(_, position)| *position)
            });
            if let Some(episode) = next {
                out.push(episode);
            }
        }
        Ok(out)
    }
}

/// Walks episodes oldest to newest and returns the first one at least a minute
/// long whose listened share is under 98%. `position` gives the latest
/// recorded position in seconds.
pub fn select_next_unfinished<F>(
    mut episodes: Vec<PodcastEpisode>,
    mut position: F,
) -> Option<PodcastEpisode>
where
    F: FnMut(&PodcastEpisode) -> Option<u64>,
{
    episodes.sort_by(|a, b| a.pub_date.cmp(&b.pub_date).then_with(|| a.guid.cmp(&b.guid)));
    for episode in episodes {
        let duration = match episode.duration_secs {
            Some(duration) if duration >= MIN_EPISODE_SECS => duration,
            _ => continue,
        };
        let progress = position(&episode)
            .map(|position| position as f64 / duration as f64)
            .unwrap_or(0.0);
        if progress < FINISHED_RATIO {
            return Some(episode);
        }
    }
    None
}

pub(crate) fn play_prefix(user_id: &str, guid: &str) -> String {
    prefix_key(&join_key(&[user_id, guid]))
}

fn latest_play_in(
    plays: &impl ReadableTable<&'static str, &'static [u8]>,
    user_id: &str,
    guid: &str,
) -> Result<Option<EpisodePlay>, CatalogError> {
    let prefix = play_prefix(user_id, guid);
    let end = prefix_end(&prefix);
    let mut range = plays.range(prefix.as_str()..end.as_str())?;
    match range.next_back() {
        Some(entry) => {
            let entry = entry?;
            Ok(Some(decode_value(entry.1.value())?))
        }
        None => Ok(None),
    }
}

/// Play keys sort by (user, guid, timestamp, sequence), so the last key under
/// a (user, guid) prefix is the current position.
pub(crate) fn append_play(
    plays: &mut Table<&'static str, &'static [u8]>,
    meta: &mut Table<&'static str, &'static [u8]>,
    play: &EpisodePlay,
) -> Result<(), CatalogError> {
    let seq: u64 = match meta.get(META_PLAY_SEQ_KEY)? {
        Some(value) => decode_value(value.value())?,
        None => 0,
    };
    let next = seq + 1;
    let seq_bytes = encode_value(&next)?;
    meta.insert(META_PLAY_SEQ_KEY, seq_bytes.as_slice())?;

    let key = format!(
        "{}{:020}{}{:020}",
        play_prefix(&play.user_id, &play.guid),
        play.timestamp,
        crate::KEY_SEP,
        next
    );
    let bytes = encode_value(play)?;
    plays.insert(key.as_str(), bytes.as_slice())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podcasts::episode_id;
    use crate::test_catalog;
    use common::FeedEpisode;

    fn episode(guid: &str, pub_date: i64, duration: Option<u64>) -> PodcastEpisode {
        PodcastEpisode {
            id: guid.to_string(),
            user_id: "alice".to_string(),
            subscription_id: "sub".to_string(),
            guid: guid.to_string(),
            title: guid.to_string(),
            pub_date: Some(pub_date),
            duration_secs: duration,
            media_url: None,
            description: String::new(),
        }
    }

    #[test]
    fn skips_short_episodes() {
        let episodes = vec![
            episode("a", 1, Some(30)),
            episode("b", 2, Some(90)),
            episode("c", 3, Some(200)),
        ];
        let next = select_next_unfinished(episodes, |_| None).unwrap();
        assert_eq!(next.guid, "b");
    }

    #[test]
    fn ninety_eight_percent_counts_as_finished() {
        let episodes = vec![episode("a", 1, Some(200)), episode("b", 2, Some(200))];
        let next = select_next_unfinished(episodes.clone(), |ep| {
            (ep.guid == "a").then_some(196)
        })
        .unwrap();
        assert_eq!(next.guid, "b");

        let next = select_next_unfinished(episodes, |ep| (ep.guid == "a").then_some(195)).unwrap();
        assert_eq!(next.guid, "a");
    }

    #[test]
    fn missing_duration_is_skipped_and_order_is_oldest_first() {
        let episodes = vec![
            episode("new", 30, Some(600)),
            episode("unknown", 10, None),
            episode("old", 20, Some(600)),
        ];
        let next = select_next_unfinished(episodes, |_| None).unwrap();
        assert_eq!(next.guid, "old");
        assert!(select_next_unfinished(Vec::new(), |_| None).is_none());
    }

    #[test]
    fn position_tracks_latest_action() {
        let (_dir, catalog) = test_catalog();
        let (sub, _) = catalog
            .subscribe("alice", "https://feeds.example.com/a.xml", None, None)
            .unwrap();
        let items = vec![FeedEpisode {
            guid: "ep-1".to_string(),
            title: "One".to_string(),
            pub_date: Some(1),
            duration_secs: Some(200),
            media_url: None,
            description: String::new(),
        }];
        catalog.store_episodes("alice", &sub.id, &items).unwrap();
        let id = episode_id("alice", "ep-1");

        assert_eq!(catalog.position_for("alice", &id), None);
        catalog
            .record_action("alice", &id, PlayAction::Play, 100, Some(10), Some(200), None)
            .unwrap();
        catalog
            .record_action("alice", &id, PlayAction::Pause, 300, Some(120), Some(200), None)
            .unwrap();
        catalog
            .record_action("alice", &id, PlayAction::Resume, 200, Some(60), Some(200), None)
            .unwrap();
        assert_eq!(catalog.position_for("alice", &id), Some(120));
        assert_eq!(catalog.position_for("bob", &id), None);
        assert_eq!(catalog.plays_for_episode("alice", "ep-1").unwrap().len(), 3);

        let err = catalog
            .record_action("bob", &id, PlayAction::Play, 1, None, None, None)
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[test]
    fn next_unfinished_per_subscription_uses_plays() {
        let (_dir, catalog) = test_catalog();
        let (sub, _) = catalog
            .subscribe("alice", "https://feeds.example.com/a.xml", None, None)
            .unwrap();
        let items: Vec<FeedEpisode> = [(1, 30), (2, 90), (3, 200)]
            .iter()
            .map(|(n, duration)| FeedEpisode {
                guid: format!("ep-{}", n),
                title: format!("Episode {}", n),
                pub_date: Some(*n),
                duration_secs: Some(*duration),
                media_url: None,
                description: String::new(),
            })
            .collect();
        catalog.store_episodes("alice", &sub.id, &items).unwrap();

        let next = catalog.next_unfinished_per_subscription("alice").unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].guid, "ep-2");

        let id = episode_id("alice", "ep-2");
        catalog
            .record_action("alice", &id, PlayAction::Complete, 10, Some(90), Some(90), None)
            .unwrap();
        let next = catalog.next_unfinished_per_subscription("alice").unwrap();
        assert_eq!(next[0].guid, "ep-3");

        catalog.unsubscribe("alice", &sub.id).unwrap();
        assert!(catalog.next_unfinished_per_subscription("alice").unwrap().is_empty());
    }
}
