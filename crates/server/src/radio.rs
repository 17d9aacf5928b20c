use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use catalog::station_id;
use common::RadioStation;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::feeds::{validate_url, FeedError};
use crate::jobs::JobError;
use crate::state::AppState;
use crate::utils::now_secs;

const PAGE_SIZE: usize = 200;
const SEARCH_LIMIT: usize = 100;
const FAVICON_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_FAVICON_BYTES: usize = 512 * 1024;

/// Pages through the station directory from `start_offset` until an empty
/// page. Returns the number of stations stored.
pub async fn import_stations(
    state: &AppState,
    user_id: &str,
    start_offset: usize,
) -> Result<usize, JobError> {
    let directory_url = state.config.read().radio_directory_url.clone();
    let timeout = state.external_timeout();
    let mut offset = start_offset;
    let mut count = 0usize;

    loop {
        info!(
            "Fetching radio stations for {} with limit {} and offset {}",
            user_id, PAGE_SIZE, offset
        );
        let page = fetch_page(&state.client, &directory_url, offset, timeout).await?;
        if page.is_empty() {
            break;
        }

        let mut stations = Vec::with_capacity(page.len());
        let mut favicons = HashMap::new();
        for entry in &page {
            if let Some((station, favicon)) = station_from_json(entry) {
                if let Some(favicon) = favicon {
                    favicons.insert(station_id(user_id, &station.remote_uuid), favicon);
                }
                stations.push(station);
            }
        }
        let stored = stations.len();
        let created = state.catalog.upsert_stations(user_id, stations)?;
        count += stored;

        for id in created {
            let Some(url) = favicons.get(&id) else {
                continue;
            };
            if let Some(bytes) = fetch_favicon(&state.client, url).await {
                state.catalog.set_station_favicon(user_id, &id, bytes)?;
            }
        }
        info!("Processed {} radio stations so far for {}", count, user_id);
        offset += PAGE_SIZE;
    }
    Ok(count)
}

async fn fetch_page(
    client: &Client,
    directory_url: &str,
    offset: usize,
    timeout: Duration,
) -> Result<Vec<Value>, FeedError> {
    let url = validate_url(directory_url)?;
    let response = client
        .post(url)
        .json(&json!({ "limit": PAGE_SIZE, "offset": offset }))
        .timeout(timeout)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status(status.as_u16()));
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|err| FeedError::Parse(err.to_string()))
}

/// Queries the station directory by name without storing anything. The
/// favicon URL stays in each station's raw record.
pub async fn search_directory(
    client: &Client,
    directory_url: &str,
    name: &str,
    timeout: Duration,
) -> Result<Vec<RadioStation>, FeedError> {
    let url = validate_url(directory_url)?;
    let response = client
        .post(url)
        .json(&json!({ "name": name, "limit": SEARCH_LIMIT }))
        .timeout(timeout)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status(status.as_u16()));
    }
    let body = response.text().await?;
    let entries: Vec<Value> =
        serde_json::from_str(&body).map_err(|err| FeedError::Parse(err.to_string()))?;
    Ok(entries
        .iter()
        .filter_map(station_from_json)
        .map(|(station, _)| station)
        .collect())
}

/// Maps one directory record. Records without a uuid are skipped. The second
/// value is the favicon URL, if any.
fn station_from_json(entry: &Value) -> Option<(RadioStation, Option<String>)> {
    let uuid = text_field(entry, "stationuuid");
    if uuid.is_empty() {
        return None;
    }
    let bitrate = entry
        .get("bitrate")
        .and_then(|value| match value {
            Value::Number(number) => number.as_u64(),
            Value::String(raw) => raw.trim().parse().ok(),
            _ => None,
        })
        .and_then(|value| u32::try_from(value).ok())
        .filter(|value| *value > 0);
    let favicon = Some(text_field(entry, "favicon")).filter(|url| !url.is_empty());
    let station = RadioStation {
        id: String::new(),
        user_id: String::new(),
        remote_uuid: uuid,
        name: text_field(entry, "name"),
        stream_url: text_field(entry, "url_resolved"),
        homepage: text_field(entry, "homepage"),
        favicon: None,
        country: text_field(entry, "country"),
        state: text_field(entry, "state"),
        language: text_field(entry, "language"),
        bitrate,
        codec: text_field(entry, "codec"),
        tags: text_field(entry, "tags"),
        favorited: false,
        raw: entry.to_string(),
        last_updated: now_secs(),
    };
    Some((station, favicon))
}

fn text_field(entry: &Value, key: &str) -> String {
    entry
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

async fn fetch_favicon(client: &Client, url: &str) -> Option<Vec<u8>> {
    let url = validate_url(url).ok()?;
    if !resolves_to_public(&url).await {
        debug!("Skipping favicon on non-public host: {}", url);
        return None;
    }
    let response = match client.get(url.clone()).timeout(FAVICON_TIMEOUT).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            debug!("Favicon fetch for {} returned {}", url, response.status());
            return None;
        }
        Err(err) => {
            debug!("Favicon fetch failed for {}: {}", url, err);
            return None;
        }
    };
    match response.bytes().await {
        Ok(bytes) if !bytes.is_empty() && bytes.len() <= MAX_FAVICON_BYTES => Some(bytes.to_vec()),
        Ok(_) => None,
        Err(err) => {
            debug!("Favicon body read failed for {}: {}", url, err);
            None
        }
    }
}

async fn resolves_to_public(url: &Url) -> bool {
    let host = match url.host_str() {
        Some(host) => host.trim_start_matches('[').trim_end_matches(']').to_string(),
        None => return false,
    };
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = match tokio::time::timeout(
        FAVICON_TIMEOUT,
        tokio::net::lookup_host((host.as_str(), port)),
    )
    .await
    {
        Ok(Ok(addrs)) => addrs.collect::<Vec<_>>(),
        _ => return false,
    };
    !addrs.is_empty() && addrs.iter().all(|addr| is_public_ip(addr.ip()))
}

pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || a == 0
                || a >= 240
                || (a == 100 && (64..128).contains(&b)))
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_public_ip(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn classifies_addresses() {
        assert!(is_public_ip("93.184.216.34".parse().unwrap()));
        assert!(!is_public_ip("10.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("100.64.0.1".parse().unwrap()));
        assert!(!is_public_ip("::1".parse().unwrap()));
        assert!(!is_public_ip("fd00::1".parse().unwrap()));
        assert!(!is_public_ip("::ffff:192.168.1.1".parse().unwrap()));
        assert!(is_public_ip("2606:4700::1111".parse().unwrap()));
    }

    #[test]
    fn maps_directory_records() {
        let entry = json!({
            "stationuuid": "u-1",
            "name": " Radio One ",
            "url_resolved": "https://stream.example.com/one",
            "bitrate": 128,
            "codec": "MP3",
            "favicon": "https://example.com/icon.png"
        });
        let (station, favicon) = station_from_json(&entry).unwrap();
        assert_eq!(station.name, "Radio One");
        assert_eq!(station.bitrate, Some(128));
        assert_eq!(favicon.as_deref(), Some("https://example.com/icon.png"));
        assert!(station.raw.contains("u-1"));
        assert!(station_from_json(&json!({ "name": "no uuid" })).is_none());
    }

    #[tokio::test]
    async fn imports_until_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/json/stations/search"))
            .and(body_partial_json(json!({ "offset": 0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "stationuuid": "u-1", "name": "One", "favicon": "http://127.0.0.1/x.png" },
                { "name": "skipped" },
                { "stationuuid": "u-2", "name": "Two" }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/json/stations/search"))
            .and(body_partial_json(json!({ "offset": 200 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let (_dir, state) = test_state();
        state.config.write().radio_directory_url = format!("{}/json/stations/search", server.uri());
        let count = import_stations(&state, "alice", 0).await.unwrap();
        assert_eq!(count, 2);
        let (stations, total) = state.catalog.list_stations("alice", None, 10, 0).unwrap();
        assert_eq!(total, 2);
        assert!(stations.iter().all(|station| station.favicon.is_none()));

        let count = import_stations(&state, "alice", 0).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(state.catalog.list_stations("alice", None, 10, 0).unwrap().1, 2);
    }

    #[tokio::test]
    async fn searches_directory_by_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/json/stations/search"))
            .and(body_partial_json(json!({ "name": "jazz" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "stationuuid": "u-9", "name": "Jazz Nine", "url_resolved": "https://s.example.com/9" },
                { "name": "no uuid" }
            ])))
            .mount(&server)
            .await;

        let url = format!("{}/json/stations/search", server.uri());
        let stations = search_directory(&Client::new(), &url, "jazz", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].remote_uuid, "u-9");
        assert_eq!(stations[0].stream_url, "https://s.example.com/9");
    }
}
