//! Company registry client (office search by founding date).

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use leadflow_shared::{Company, CompanyId, RegistryConfig, is_valid_email};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::http::{self, RateLimitPolicy};
use crate::{Candidate, ConnectorError, RegistrySource};

/// Status assumed when the registry omits one.
const DEFAULT_STATUS: &str = "Ativa";

/// Settings for [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryClientOptions {
    pub base_url: String,
    /// Sent verbatim in the `Authorization` header.
    pub token: String,
    pub timeout: Duration,
    /// State filter (`address.state.in`); empty means nationwide.
    pub states: Vec<String>,
    pub page_size: u32,
    pub max_pages: u32,
    pub rate_limit: RateLimitPolicy,
}

impl RegistryClientOptions {
    pub fn from_config(config: &RegistryConfig, token: String, max_retries: u32) -> Self {
        Self {
            base_url: config.base_url.clone(),
            token,
            timeout: Duration::from_secs(config.timeout_secs),
            states: config.states.clone(),
            page_size: config.page_size,
            max_pages: config.max_pages,
            rate_limit: RateLimitPolicy::with_max_retries(max_retries),
        }
    }
}

/// HTTP implementation of [`RegistrySource`].
pub struct RegistryClient {
    client: Client,
    opts: RegistryClientOptions,
}

impl RegistryClient {
    pub fn new(opts: RegistryClientOptions) -> Result<Self, ConnectorError> {
        let client = http::build_client(opts.timeout)
            .map_err(|e| ConnectorError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, opts })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.opts.base_url.trim_end_matches('/'))
    }

    /// `GET {base}/health`; any 2xx is healthy.
    pub async fn health_check(&self) -> Result<(), ConnectorError> {
        let url = self.endpoint("health");
        let response = self
            .client
            .get(&url)
            .header("Authorization", &self.opts.token)
            .timeout(http::HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| ConnectorError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ConnectorError::Upstream {
                status: status.as_u16(),
                message: http::error_snippet(response).await,
            })
        }
    }

    async fn fetch_page(
        &self,
        date: NaiveDate,
        cursor: Option<&str>,
    ) -> Result<OfficePage, ConnectorError> {
        let url = self.endpoint("office");
        let day = date.format("%Y-%m-%d").to_string();

        let mut query: Vec<(&str, String)> = vec![
            ("founded.gte", day.clone()),
            ("founded.lte", day),
            ("limit", self.opts.page_size.to_string()),
        ];
        if !self.opts.states.is_empty() {
            query.push(("address.state.in", self.opts.states.join(",")));
        }
        if let Some(cursor) = cursor {
            query.push(("token", cursor.to_string()));
        }

        let response = http::send_with_rate_limit(
            || {
                self.client
                    .get(&url)
                    .header("Authorization", &self.opts.token)
                    .query(&query)
            },
            &self.opts.rate_limit,
            "registry",
        )
        .await
        .map_err(|e| ConnectorError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ConnectorError::Upstream {
                status: status.as_u16(),
                message: "registry token rejected".into(),
            });
        }
        if !status.is_success() {
            return Err(ConnectorError::Upstream {
                status: status.as_u16(),
                message: http::error_snippet(response).await,
            });
        }

        response
            .json::<OfficePage>()
            .await
            .map_err(|e| ConnectorError::Parse(format!("office page: {e}")))
    }
}

#[async_trait]
impl RegistrySource for RegistryClient {
    #[instrument(skip_all, fields(date = %date))]
    async fn fetch_created_on(&self, date: NaiveDate) -> Result<Vec<Candidate>, ConnectorError> {
        let mut candidates = Vec::new();
        let mut cursor: Option<String> = None;

        for page_no in 1..=self.opts.max_pages.max(1) {
            let page = self.fetch_page(date, cursor.as_deref()).await?;
            debug!(page = page_no, records = page.records.len(), "registry page");
            candidates.extend(page.records.into_iter().map(record_to_candidate));

            match page.next {
                Some(next) if !next.is_empty() => {
                    if page_no == self.opts.max_pages {
                        warn!(
                            max_pages = self.opts.max_pages,
                            "registry has more pages than allowed; results truncated"
                        );
                    }
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        info!(found = candidates.len(), "registry fetch complete");
        Ok(candidates)
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OfficePage {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    records: Vec<OfficeRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct OfficeRecord {
    tax_id: Option<String>,
    alias: Option<String>,
    founded: Option<String>,
    company: Option<CompanyPart>,
    status: Option<TextPart>,
    emails: Vec<EmailPart>,
    phones: Vec<PhonePart>,
    address: Option<AddressPart>,
    main_activity: Option<TextPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CompanyPart {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TextPart {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EmailPart {
    address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PhonePart {
    area: Option<String>,
    number: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AddressPart {
    street: Option<String>,
    number: Option<Value>,
    details: Option<String>,
    district: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip: Option<Value>,
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

fn record_to_candidate(record: OfficeRecord) -> Candidate {
    let identifier = record.tax_id.clone().unwrap_or_default().trim().to_string();
    match coerce(record, &identifier) {
        Ok(company) => Candidate::Valid(company),
        Err(reason) => {
            warn!(identifier = %identifier, reason = %reason, "malformed registry record");
            Candidate::Malformed { identifier, reason }
        }
    }
}

fn coerce(record: OfficeRecord, identifier: &str) -> Result<Company, String> {
    let id = CompanyId::normalize(identifier).map_err(|e| e.to_string())?;
    if !id.has_valid_check_digits() {
        return Err(format!("identifier {identifier:?} fails check digits"));
    }

    let legal_name = record
        .company
        .and_then(|c| non_empty(c.name))
        .ok_or_else(|| "missing company name".to_string())?;

    let founded = record.founded.unwrap_or_default();
    let registered_on = parse_founded(&founded)
        .ok_or_else(|| format!("invalid founding date {founded:?}"))?;

    let email = record
        .emails
        .into_iter()
        .next()
        .and_then(|e| non_empty(e.address))
        .map(|e| e.to_lowercase())
        .filter(|e| {
            let ok = is_valid_email(e);
            if !ok {
                debug!(identifier, email = %e, "dropping invalid email");
            }
            ok
        });

    let phone = record.phones.into_iter().next().and_then(|p| {
        let area = non_empty(p.area)?;
        let number = non_empty(p.number)?;
        Some(format!("+55 {area} {number}"))
    });

    let address = record.address.unwrap_or_default();

    Ok(Company {
        identifier: identifier.to_string(),
        legal_name,
        trade_name: non_empty(record.alias),
        email,
        phone,
        address: address_line(&address),
        city: non_empty(address.city.clone()).unwrap_or_default(),
        state: non_empty(address.state.clone()).unwrap_or_default(),
        postal_code: address.zip.as_ref().and_then(value_text),
        registered_on,
        primary_activity: record.main_activity.and_then(|a| non_empty(a.text)),
        status: record
            .status
            .and_then(|s| non_empty(s.text))
            .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
    })
}

/// Accepts `YYYY-MM-DD` or a full RFC 3339 timestamp.
fn parse_founded(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

/// `street, nº number, details, district`, skipping blanks.
fn address_line(address: &AddressPart) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(street) = non_empty(address.street.clone()) {
        parts.push(street);
    }
    if let Some(number) = address.number.as_ref().and_then(value_text) {
        parts.push(format!("nº {number}"));
    }
    if let Some(details) = non_empty(address.details.clone()) {
        parts.push(details);
    }
    if let Some(district) = non_empty(address.district.clone()) {
        parts.push(district);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Strings and numbers both show up for numeric-looking fields.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(Some(s.clone())),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
