use std::time::Duration;

use common::{FeedEpisode, FeedMetadata};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::{Client, Url};
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;
use tracing::{debug, warn};

const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug)]
pub enum FeedError {
    InvalidUrl(String),
    Http(reqwest::Error),
    Status(u16),
    Parse(String),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::InvalidUrl(url) => write!(f, "invalid url: {}", url),
            FeedError::Http(err) => write!(f, "http error: {}", err),
            FeedError::Status(status) => write!(f, "unexpected status: {}", status),
            FeedError::Parse(message) => write!(f, "parse error: {}", message),
        }
    }
}

impl std::error::Error for FeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FeedError::Http(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::Http(err)
    }
}

#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub metadata: FeedMetadata,
    pub episodes: Vec<FeedEpisode>,
}

/// Accepts absolute http(s) URLs only.
pub fn validate_url(url: &str) -> Result<Url, FeedError> {
    let parsed = Url::parse(url.trim()).map_err(|_| FeedError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(FeedError::InvalidUrl(url.to_string())),
    }
}

pub async fn fetch_feed(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<ParsedFeed, FeedError> {
    let url = validate_url(url)?;
    let response = client.get(url.clone()).timeout(timeout).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status(status.as_u16()));
    }
    let body = response.text().await?;
    let parsed = parse_feed(&body)?;
    debug!(
        "Parsed feed {}: {} episodes",
        url,
        parsed.episodes.len()
    );
    Ok(parsed)
}

pub async fn fetch_subscription_metadata(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<FeedMetadata, FeedError> {
    Ok(fetch_feed(client, url, timeout).await?.metadata)
}

pub async fn fetch_episodes(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<FeedEpisode>, FeedError> {
    Ok(fetch_feed(client, url, timeout).await?.episodes)
}

/// Downloads an image and returns it as a data URI. Failures are logged and
/// yield `None`.
pub async fn fetch_image_data_uri(client: &Client, url: &str, timeout: Duration) -> Option<String> {
    let url = validate_url(url).ok()?;
    let response = match client.get(url.clone()).timeout(timeout).send().await {
        Ok(response) => response,
        Err(err) => {
            debug!("Image fetch failed for {}: {}", url, err);
            return None;
        }
    };
    if !response.status().is_success() {
        debug!("Image fetch for {} returned {}", url, response.status());
        return None;
    }
    let is_image = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("image/"))
        .unwrap_or(true);
    if !is_image {
        return None;
    }
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!("Image body read failed for {}: {}", url, err);
            return None;
        }
    };
    if bytes.is_empty() || bytes.len() > MAX_IMAGE_BYTES {
        return None;
    }
    Some(metadata::cover_data_uri(&bytes))
}

/// Sums `part * 60^i` over the colon-separated parts, last part first.
pub fn parse_duration(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = 0u64;
    for (index, part) in raw.rsplit(':').enumerate() {
        let whole = part.trim().split('.').next().unwrap_or("");
        let value: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().ok()?
        };
        let factor = 60u64.checked_pow(index as u32)?;
        total = total.checked_add(value.checked_mul(factor)?)?;
    }
    Some(total)
}

pub fn parse_date(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = OffsetDateTime::parse(raw, &Rfc2822) {
        return Some(date.unix_timestamp());
    }
    if let Ok(date) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(date.unix_timestamp());
    }
    for zone in [" GMT", " UTC", " UT", " Z"] {
        if let Some(stripped) = raw.strip_suffix(zone) {
            let patched = format!("{} +0000", stripped);
            if let Ok(date) = OffsetDateTime::parse(&patched, &Rfc2822) {
                return Some(date.unix_timestamp());
            }
        }
    }
    None
}

#[derive(Default)]
struct ItemBuilder {
    guid: String,
    title: String,
    pub_date: Option<i64>,
    duration_secs: Option<u64>,
    media_url: Option<String>,
    description: String,
    summary: String,
}

impl ItemBuilder {
    fn finish(self) -> Option<FeedEpisode> {
        let guid = self.guid.trim().to_string();
        if guid.is_empty() {
            return None;
        }
        let description = if self.description.is_empty() {
            self.summary
        } else {
            self.description
        };
        Some(FeedEpisode {
            guid,
            title: self.title,
            pub_date: self.pub_date,
            duration_secs: self.duration_secs,
            media_url: self.media_url,
            description,
        })
    }
}

/// Parses RSS 2.0 (with iTunes tags) or Atom. Items without a guid are
/// dropped.
pub fn parse_feed(xml: &str) -> Result<ParsedFeed, FeedError> {
    let mut reader = Reader::from_str(xml);

    let mut feed = ParsedFeed::default();
    let mut stack: Vec<String> = Vec::new();
    // Text collected per open element; inline markup feeds its text to the parent.
    let mut texts: Vec<String> = Vec::new();
    let mut item: Option<ItemBuilder> = None;
    let mut saw_root = false;
    let mut atom_author = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = element_name(&e);
                match name.as_str() {
                    "rss" | "channel" | "feed" | "rdf:RDF" => saw_root = true,
                    "item" | "entry" if saw_root => item = Some(ItemBuilder::default()),
                    _ => {}
                }
                apply_attributes(&e, &name, &stack, &mut feed.metadata, item.as_mut());
                stack.push(name);
                texts.push(String::new());
            }
            Ok(Event::Empty(e)) => {
                let name = element_name(&e);
                apply_attributes(&e, &name, &stack, &mut feed.metadata, item.as_mut());
            }
            Ok(Event::Text(e)) => match e.unescape() {
                Ok(value) => {
                    if let Some(text) = texts.last_mut() {
                        text.push_str(&value);
                    }
                }
                Err(err) => debug!("Skipping undecodable feed text: {}", err),
            },
            Ok(Event::CData(e)) => {
                if let Some(text) = texts.last_mut() {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::End(_)) => {
                let (name, value) = match (stack.pop(), texts.pop()) {
                    (Some(name), Some(value)) => (name, value),
                    _ => continue,
                };
                if !matches!(name.as_str(), "item" | "entry") {
                    if let Some(outer) = texts.last_mut() {
                        outer.push_str(&value);
                    }
                }
                let value = value.trim();
                let parent = stack.last().map(String::as_str).unwrap_or("");
                if matches!(name.as_str(), "item" | "entry") && item.is_some() {
                    if let Some(episode) = item.take().and_then(ItemBuilder::finish) {
                        feed.episodes.push(episode);
                    }
                    continue;
                }
                if let Some(builder) = item.as_mut() {
                    if matches!(parent, "item" | "entry") {
                        apply_item_text(builder, &name, value);
                    }
                    continue;
                }
                apply_channel_text(&mut feed.metadata, &mut atom_author, &stack, &name, value);
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                if feed.episodes.is_empty() {
                    return Err(FeedError::Parse(err.to_string()));
                }
                warn!(
                    "Feed XML error after {} episodes, keeping parsed items: {}",
                    feed.episodes.len(),
                    err
                );
                break;
            }
            _ => {}
        }
    }

    if !saw_root {
        return Err(FeedError::Parse("document is not an RSS or Atom feed".to_string()));
    }
    if feed.metadata.author.is_empty() {
        feed.metadata.author = atom_author;
    }
    Ok(feed)
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key.as_bytes())
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.trim().to_string()))
        .filter(|value| !value.is_empty())
}

fn apply_attributes(
    e: &BytesStart<'_>,
    name: &str,
    stack: &[String],
    metadata: &mut FeedMetadata,
    item: Option<&mut ItemBuilder>,
) {
    let parent = stack.last().map(String::as_str).unwrap_or("");
    match item {
        Some(builder) => match name {
            "enclosure" if builder.media_url.is_none() => {
                builder.media_url = attribute(e, "url");
            }
            "link" if parent == "entry" => {
                if attribute(e, "rel").as_deref() == Some("enclosure") && builder.media_url.is_none() {
                    builder.media_url = attribute(e, "href");
                }
            }
            _ => {}
        },
        None => match name {
            "itunes:image" if parent == "channel" => {
                if let Some(href) = attribute(e, "href") {
                    metadata.image_url = Some(href);
                }
            }
            "link" if parent == "feed" && metadata.link.is_empty() => {
                let rel = attribute(e, "rel");
                if rel.is_none() || rel.as_deref() == Some("alternate") {
                    metadata.link = attribute(e, "href").unwrap_or_default();
                }
            }
            _ => {}
        },
    }
}

fn apply_item_text(builder: &mut ItemBuilder, name: &str, value: &str) {
    match name {
        "guid" | "id" => builder.guid = value.to_string(),
        "title" => builder.title = value.to_string(),
        "pubDate" | "published" => builder.pub_date = parse_date(value),
        "updated" if builder.pub_date.is_none() => builder.pub_date = parse_date(value),
        "itunes:duration" => builder.duration_secs = parse_duration(value),
        "description" | "content" | "content:encoded" if builder.description.is_empty() => {
            builder.description = value.to_string();
        }
        "summary" | "itunes:summary" => builder.summary = value.to_string(),
        _ => {}
    }
}

fn apply_channel_text(
    metadata: &mut FeedMetadata,
    atom_author: &mut String,
    stack: &[String],
    name: &str,
    value: &str,
) {
    let parent = stack.last().map(String::as_str).unwrap_or("");
    let grandparent = stack
        .len()
        .checked_sub(2)
        .and_then(|index| stack.get(index))
        .map(String::as_str)
        .unwrap_or("");
    match (parent, name) {
        ("channel" | "feed", "title") => metadata.title = value.to_string(),
        ("channel", "description") | ("feed", "subtitle") => {
            metadata.description = value.to_string();
        }
        ("channel", "itunes:summary") if metadata.description.is_empty() => {
            metadata.description = value.to_string();
        }
        ("channel", "link") if metadata.link.is_empty() => metadata.link = value.to_string(),
        ("channel", "itunes:author") => metadata.author = value.to_string(),
        ("channel", "managingEditor") if metadata.author.is_empty() => {
            metadata.author = value.to_string();
        }
        ("author", "name") if grandparent == "feed" => *atom_author = value.to_string(),
        ("image", "url") if grandparent == "channel" && metadata.image_url.is_none() => {
            metadata.image_url = Some(value.to_string()).filter(|url| !url.is_empty());
        }
        ("feed", "logo" | "icon") if metadata.image_url.is_none() => {
            metadata.image_url = Some(value.to_string()).filter(|url| !url.is_empty());
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Night Shift</title>
    <link>https://nightshift.example.com</link>
    <description>Late &amp; loud</description>
    <itunes:author>The Crew</itunes:author>
    <itunes:image href="https://nightshift.example.com/cover.jpg"/>
    <image><url>https://nightshift.example.com/small.jpg</url><title>ignored</title></image>
    <item>
      <title>Episode 2</title>
      <guid isPermaLink="false">ns-2</guid>
      <pubDate>Tue, 02 Jan 2024 10:00:00 +0000</pubDate>
      <itunes:duration>01:02:03</itunes:duration>
      <enclosure url="https://cdn.example.com/ns-2.mp3" length="1" type="audio/mpeg"/>
      <description><![CDATA[<p>Second</p>]]></description>
    </item>
    <item>
      <title>No guid here</title>
      <enclosure url="https://cdn.example.com/none.mp3" type="audio/mpeg"/>
    </item>
    <item>
      <title>Episode 1</title>
      <guid>ns-1</guid>
      <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
      <itunes:duration>90</itunes:duration>
      <enclosure url="https://cdn.example.com/ns-1.mp3" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_rss_with_itunes_tags() {
        let feed = parse_feed(RSS).unwrap();
        assert_eq!(feed.metadata.title, "Night Shift");
        assert_eq!(feed.metadata.author, "The Crew");
        assert_eq!(feed.metadata.description, "Late & loud");
        assert_eq!(feed.metadata.link, "https://nightshift.example.com");
        assert_eq!(
            feed.metadata.image_url.as_deref(),
            Some("https://nightshift.example.com/cover.jpg")
        );

        assert_eq!(feed.episodes.len(), 2);
        let first = &feed.episodes[0];
        assert_eq!(first.guid, "ns-2");
        assert_eq!(first.duration_secs, Some(3723));
        assert_eq!(first.media_url.as_deref(), Some("https://cdn.example.com/ns-2.mp3"));
        assert_eq!(first.description, "<p>Second</p>");
        assert_eq!(first.pub_date, Some(1_704_189_600));
        assert_eq!(feed.episodes[1].pub_date, Some(1_704_103_200));
        assert_eq!(feed.episodes[1].duration_secs, Some(90));
    }

    #[test]
    fn parses_atom_entries() {
        let xml = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atomic</title>
  <subtitle>Short takes</subtitle>
  <link rel="self" href="https://atomic.example.com/feed"/>
  <link href="https://atomic.example.com/"/>
  <author><name>Ada</name></author>
  <logo>https://atomic.example.com/logo.png</logo>
  <entry>
    <id>urn:uuid:1</id>
    <title>First</title>
    <published>2024-03-01T12:00:00Z</published>
    <link rel="enclosure" href="https://atomic.example.com/1.ogg"/>
    <summary>Hello</summary>
  </entry>
</feed>"#;
        let feed = parse_feed(xml).unwrap();
        assert_eq!(feed.metadata.title, "Atomic");
        assert_eq!(feed.metadata.author, "Ada");
        assert_eq!(feed.metadata.link, "https://atomic.example.com/");
        assert_eq!(feed.metadata.description, "Short takes");
        assert_eq!(feed.episodes.len(), 1);
        assert_eq!(feed.episodes[0].guid, "urn:uuid:1");
        assert_eq!(feed.episodes[0].description, "Hello");
        assert_eq!(
            feed.episodes[0].media_url.as_deref(),
            Some("https://atomic.example.com/1.ogg")
        );
        assert_eq!(feed.episodes[0].pub_date, Some(1_709_294_400));
    }

    #[test]
    fn keeps_text_around_inline_markup() {
        let xml = r#"<rss version="2.0"><channel>
  <title>Mixed <i>Signals</i></title>
  <item>
    <guid>m-1</guid>
    <title>One</title>
    <description>Intro <b>bold</b> tail</description>
  </item>
</channel></rss>"#;
        let feed = parse_feed(xml).unwrap();
        assert_eq!(feed.metadata.title, "Mixed Signals");
        assert_eq!(feed.episodes.len(), 1);
        assert_eq!(feed.episodes[0].title, "One");
        assert_eq!(feed.episodes[0].description, "Intro bold tail");
    }

    #[test]
    fn rejects_non_feed_documents() {
        assert!(matches!(parse_feed("<html><body/></html>"), Err(FeedError::Parse(_))));
        assert!(matches!(parse_feed("not xml <"), Err(FeedError::Parse(_))));
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("01:02:03"), Some(3723));
        assert_eq!(parse_duration("90"), Some(90));
        assert_eq!(parse_duration("2:30"), Some(150));
        assert_eq!(parse_duration("12.7"), Some(12));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn unparseable_dates_are_none() {
        assert_eq!(parse_date("yesterday"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn validates_urls() {
        assert!(validate_url("https://feeds.example.com/a.xml").is_ok());
        assert!(matches!(validate_url("ftp://x/y"), Err(FeedError::InvalidUrl(_))));
        assert!(matches!(validate_url("not a url"), Err(FeedError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn fetches_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = Client::new();
        let timeout = Duration::from_secs(5);
        let url = format!("{}/feed.xml", server.uri());
        let metadata = fetch_subscription_metadata(&client, &url, timeout).await.unwrap();
        assert_eq!(metadata.title, "Night Shift");
        let episodes = fetch_episodes(&client, &url, timeout).await.unwrap();
        assert_eq!(episodes.len(), 2);

        let url = format!("{}/gone.xml", server.uri());
        let err = fetch_episodes(&client, &url, timeout).await.unwrap_err();
        assert!(matches!(err, FeedError::Status(404)));
    }
}
