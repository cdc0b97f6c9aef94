//! Google Calendar v3 implementation of [`ProviderClient`]

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use super::models::{GoogleErrorBody, GoogleEvent, GoogleEventsPage, OtherContactsResponse};
use super::token::TokenSource;
use crate::error::ProviderError;
use crate::models::{CalendarEvent, DateRange, DeleteScope, Draft};
use crate::traits::{EventStream, ProviderClient};
use crate::utils::retry::RetryPolicy;
use crate::utils::time::format_date_time;

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/calendar/v3";
pub const DEFAULT_PEOPLE_BASE_URL: &str = "https://people.googleapis.com";

const PAGE_SIZE: &str = "250";
const CONTACT_PAGE_SIZE: &str = "10";

pub struct GoogleCalendarClient {
    http: Client,
    api_base: Url,
    people_base: Url,
    calendar_id: String,
    tokens: Arc<dyn TokenSource>,
    retry: RetryPolicy,
}

impl GoogleCalendarClient {
    pub fn new(
        api_base: &str,
        people_base: &str,
        calendar_id: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        retry: RetryPolicy,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            http: Client::new(),
            api_base: Url::parse(api_base)?,
            people_base: Url::parse(people_base)?,
            calendar_id: calendar_id.into(),
            tokens,
            retry,
        })
    }

    fn url(base: &Url, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Unknown(format!("{} cannot be used as a base URL", base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn events_url(&self, event_id: Option<&str>) -> Result<Url, ProviderError> {
        let mut segments = vec!["calendars", self.calendar_id.as_str(), "events"];
        segments.extend(event_id);
        Self::url(&self.api_base, &segments)
    }

    /// Send a request built by `build`, retrying rate limits. Non-2xx responses are mapped to errors.
    async fn send<F>(&self, what: &str, build: F) -> Result<Response, ProviderError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let build = &build;
        self.retry
            .run(what, || async move {
                let token = self.tokens.access_token().await?;
                let response = build(&self.http)
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|e| ProviderError::Unknown(format!("{} request failed: {}", what, e)))?;

                if response.status().is_success() {
                    Ok(response)
                } else {
                    Err(error_from_response(response).await)
                }
            })
            .await
    }

    async fn send_json<T, F>(&self, what: &str, build: F) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.send(what, build).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Unknown(format!("Failed to decode {} response: {}", what, e)))
    }

    async fn fetch_page(
        &self,
        range: &DateRange,
        page_token: Option<&str>,
    ) -> Result<GoogleEventsPage, ProviderError> {
        let url = self.events_url(None)?;
        let mut query = vec![
            ("timeMin", format_date_time(&range.start)),
            ("timeMax", format_date_time(&range.end)),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
            ("maxResults", PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        debug!("Fetching events page for {} (token: {:?})", range, page_token);
        self.send_json("list events", |http| http.get(url.clone()).query(&query))
            .await
    }

    async fn write_event(
        &self,
        what: &str,
        method: Method,
        url: Url,
        body: &GoogleEvent,
    ) -> Result<CalendarEvent, ProviderError> {
        let event: GoogleEvent = self
            .send_json(what, |http| {
                http.request(method.clone(), url.clone())
                    .query(&[("conferenceDataVersion", "1"), ("sendUpdates", "all")])
                    .json(body)
            })
            .await?;
        CalendarEvent::try_from(event)
    }
}

/// Map a failed Google response onto the provider error taxonomy
async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify(status, &body)
}

fn classify(status: StatusCode, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<GoogleErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| b.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status));
    let rate_limited = parsed.as_ref().is_some_and(|b| {
        b.error
            .errors
            .iter()
            .any(|e| e.reason == "rateLimitExceeded" || e.reason == "userRateLimitExceeded")
    });

    match status {
        StatusCode::UNAUTHORIZED => ProviderError::AuthExpired(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { attempts: 1 },
        StatusCode::FORBIDDEN if rate_limited => ProviderError::RateLimited { attempts: 1 },
        StatusCode::NOT_FOUND | StatusCode::GONE => ProviderError::NotFound(message),
        StatusCode::BAD_REQUEST => ProviderError::Validation(message),
        _ => {
            warn!("Unexpected Google API response: HTTP {} - {}", status, body);
            ProviderError::Unknown(format!("HTTP {} - {}", status, message))
        }
    }
}

#[async_trait]
impl ProviderClient for GoogleCalendarClient {
    fn list_events(&self, range: DateRange) -> EventStream<'_> {
        // Some(None) fetches the first page, None means the listing is exhausted
        let pages = stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(page_token) = cursor else {
                return Ok::<_, ProviderError>(None);
            };
            let page = self.fetch_page(&range, page_token.as_deref()).await?;
            let next = page.next_page_token.map(Some);
            let events: Vec<Result<CalendarEvent, ProviderError>> = page
                .items
                .into_iter()
                .filter(|e| e.status.as_deref() != Some("cancelled"))
                .map(CalendarEvent::try_from)
                .collect();
            Ok(Some((stream::iter(events), next)))
        });

        pages.try_flatten().boxed()
    }

    async fn get_event(&self, id: &str) -> Result<CalendarEvent, ProviderError> {
        let url = self.events_url(Some(id))?;
        let event: GoogleEvent = self
            .send_json("get event", |http| http.get(url.clone()))
            .await?;
        if event.status.as_deref() == Some("cancelled") {
            return Err(ProviderError::NotFound(id.to_string()));
        }
        CalendarEvent::try_from(event)
    }

    async fn create_event(&self, draft: &Draft) -> Result<CalendarEvent, ProviderError> {
        let url = self.events_url(None)?;
        let body = GoogleEvent::from_draft(draft);
        self.write_event("create event", Method::POST, url, &body).await
    }

    async fn update_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ProviderError> {
        let url = self.events_url(Some(&event.id))?;
        let body = GoogleEvent::from_event(event);
        self.write_event("update event", Method::PUT, url, &body).await
    }

    async fn delete_event(&self, id: &str, scope: DeleteScope) -> Result<(), ProviderError> {
        // Scope resolution happens before this call; Google deletes exactly the id it is given
        debug!("Deleting event {} ({})", id, scope);
        let url = self.events_url(Some(id))?;
        self.send("delete event", |http| {
            http.delete(url.clone()).query(&[("sendUpdates", "all")])
        })
        .await?;
        Ok(())
    }

    async fn search_contacts(&self, query: &str) -> Result<Vec<String>, ProviderError> {
        let url = Self::url(&self.people_base, &["v1", "otherContacts:search"])?;
        let response: OtherContactsResponse = self
            .send_json("search contacts", |http| {
                http.get(url.clone()).query(&[
                    ("query", query),
                    ("readMask", "emailAddresses"),
                    ("pageSize", CONTACT_PAGE_SIZE),
                ])
            })
            .await?;

        Ok(response
            .results
            .into_iter()
            .flat_map(|r| r.person.email_addresses)
            .map(|e| e.value.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_is_only_rate_limited_with_the_right_reason() {
        let body = r#"{"error":{"code":403,"message":"Rate Limit Exceeded","errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        assert_eq!(
            classify(StatusCode::FORBIDDEN, body),
            ProviderError::RateLimited { attempts: 1 }
        );

        let body = r#"{"error":{"code":403,"message":"Forbidden","errors":[{"reason":"forbidden"}]}}"#;
        assert!(matches!(classify(StatusCode::FORBIDDEN, body), ProviderError::Unknown(_)));
    }

    #[test]
    fn gone_counts_as_not_found() {
        assert!(matches!(classify(StatusCode::GONE, ""), ProviderError::NotFound(_)));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, r#"{"error":{"message":"Bad end time"}}"#),
            ProviderError::Validation(m) if m == "Bad end time"
        ));
    }

    #[test]
    fn calendar_ids_are_escaped_in_paths() {
        let client = GoogleCalendarClient::new(
            "http://localhost/calendar/v3/",
            DEFAULT_PEOPLE_BASE_URL,
            "team cal#1",
            Arc::new(super::super::token::StaticToken::new("t")),
            RetryPolicy::default(),
        )
        .unwrap();
        let url = client.events_url(Some("abc")).unwrap();
        assert_eq!(url.path(), "/calendar/v3/calendars/team%20cal%231/events/abc");
    }
}
