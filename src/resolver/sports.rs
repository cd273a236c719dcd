use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use reqwest::Client;
use tracing::debug;

use super::provider::{Candidate, EventStatus, MatchProvider, ProviderEvent};

/// Result feed backed by TheSportsDB v1 REST API.
/// Docs: <https://www.thesportsdb.com/api.php>
pub struct TheSportsDbProvider {
    http: Client,
    api_key: String,
    /// Base URL for overriding in tests
    base_url: String,
}

impl TheSportsDbProvider {
    pub fn new(api_key: Option<&str>, base_url: Option<&str>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(TheSportsDbProvider {
            http,
            // "3" is TheSportsDB's public free-tier key
            api_key: api_key.unwrap_or("3").to_string(),
            base_url: base_url
                .unwrap_or("https://www.thesportsdb.com/api/v1/json")
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn status_from_str(s: &str) -> EventStatus {
        match s.trim().to_lowercase().as_str() {
            "" | "not started" | "ns" | "tbd" | "time to be defined" => EventStatus::Scheduled,
            "half time" | "ht" | "halftime" => EventStatus::HalfTime,
            "match finished" | "ft" | "finished" | "aet" | "pen" | "ap" | "aot" => {
                EventStatus::Finished
            }
            "postponed" | "pst" | "match postponed" => EventStatus::Postponed,
            "cancelled" | "canc" | "canceled" | "match cancelled" => EventStatus::Cancelled,
            "abandoned" | "abd" | "match abandoned" | "susp" | "suspended" => {
                EventStatus::Abandoned
            }
            _ => EventStatus::InProgress,
        }
    }

    async fn get_events(&self, url: &str) -> Result<Vec<ProviderEvent>> {
        debug!("Fetching {}", url);
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("TheSportsDB request failed")?;

        if !resp.status().is_success() {
            anyhow::bail!("TheSportsDB error: {}", resp.status());
        }

        let raw: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse TheSportsDB response")?;

        Ok(parse_events(&raw))
    }
}

#[async_trait]
impl MatchProvider for TheSportsDbProvider {
    fn name(&self) -> &str {
        "TheSportsDB"
    }

    async fn fetch_event(&self, event_id: &str) -> Result<Option<ProviderEvent>> {
        let url = format!(
            "{}/{}/lookupevent.php?id={}",
            self.base_url, self.api_key, event_id
        );
        let events = self.get_events(&url).await?;
        Ok(events.into_iter().find(|e| e.id == event_id))
    }

    async fn list_candidates(&self, date: NaiveDate, sport: &str) -> Result<Vec<Candidate>> {
        let mut url = format!(
            "{}/{}/eventsday.php?d={}",
            self.base_url,
            self.api_key,
            date.format("%Y-%m-%d")
        );
        if let Some(s) = feed_sport_name(sport) {
            url.push_str("&s=");
            url.push_str(&s.replace(' ', "%20"));
        }
        let events = self.get_events(&url).await?;
        Ok(events.iter().map(Candidate::from).collect())
    }
}

/// The feed's spelling of our sport keys.
fn feed_sport_name(sport: &str) -> Option<&'static str> {
    match sport.to_lowercase().as_str() {
        "soccer" | "football" => Some("Soccer"),
        "basketball" | "nba" => Some("Basketball"),
        "american_football" | "nfl" => Some("American Football"),
        "baseball" | "mlb" => Some("Baseball"),
        "ice_hockey" | "nhl" => Some("Ice Hockey"),
        "tennis" => Some("Tennis"),
        _ => None,
    }
}

fn parse_events(raw: &serde_json::Value) -> Vec<ProviderEvent> {
    let events = match raw["events"].as_array() {
        Some(a) => a,
        None => return vec![],
    };

    events
        .iter()
        .filter_map(|ev| {
            let id = ev["idEvent"].as_str()?.to_string();
            let sport = ev["strSport"]
                .as_str()
                .unwrap_or("soccer")
                .to_lowercase()
                .replace(' ', "_");
            let league = ev["strLeague"].as_str().map(|s| s.to_string());
            let home_team = ev["strHomeTeam"].as_str()?.to_string();
            let away_team = ev["strAwayTeam"].as_str()?.to_string();

            let home_score = parse_score(&ev["intHomeScore"]);
            let away_score = parse_score(&ev["intAwayScore"]);

            let status_str = ev["strStatus"].as_str().unwrap_or("");
            let mut status = TheSportsDbProvider::status_from_str(status_str);
            // Some rows flag postponement outside strStatus
            if status == EventStatus::Scheduled
                && status_str.is_empty()
                && ev["strPostponed"].as_str() == Some("yes")
            {
                status = EventStatus::Postponed;
            }

            Some(ProviderEvent {
                id,
                sport,
                league,
                home_team,
                away_team,
                start_time: parse_start_time(ev),
                status,
                home_score,
                away_score,
                selection_results: Vec::new(),
            })
        })
        .collect()
}

fn parse_score(v: &serde_json::Value) -> Option<i32> {
    v.as_str()
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| v.as_i64().map(|n| n as i32))
}

fn parse_start_time(ev: &serde_json::Value) -> Option<DateTime<Utc>> {
    if let Some(ts) = ev["strTimestamp"].as_str() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S") {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    let date = NaiveDate::parse_from_str(ev["dateEvent"].as_str()?, "%Y-%m-%d").ok()?;
    let time = ev["strTime"]
        .as_str()
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M:%S").ok())
        .unwrap_or(NaiveTime::MIN);
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}
