//! CRM client: one `POST /leads` per new company.

use std::time::Duration;

use async_trait::async_trait;
use leadflow_shared::{Company, CompanyId, CrmConfig, LeadId};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::http::{self, RateLimitPolicy};
use crate::{ConnectorError, CrmError, LeadSink};

const LEAD_SOURCE: &str = "CNPJá Automation";
const LEAD_TAGS: [&str; 3] = ["automacao", "cnpja", "empresa-nova"];
const CAPTURE_CHANNEL: &str = "CNPJá API";
const SEGMENT: &str = "Contábil";

/// Settings for [`CrmClient`].
#[derive(Debug, Clone)]
pub struct CrmClientOptions {
    pub base_url: String,
    /// Sent as a bearer token.
    pub api_key: String,
    pub timeout: Duration,
    pub rate_limit: RateLimitPolicy,
}

impl CrmClientOptions {
    pub fn from_config(config: &CrmConfig, api_key: String, max_retries: u32) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
            rate_limit: RateLimitPolicy::with_max_retries(max_retries),
        }
    }
}

/// HTTP implementation of [`LeadSink`].
pub struct CrmClient {
    client: Client,
    opts: CrmClientOptions,
}

impl CrmClient {
    pub fn new(opts: CrmClientOptions) -> Result<Self, ConnectorError> {
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
            .bearer_auth(&self.opts.api_key)
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
}

#[async_trait]
impl LeadSink for CrmClient {
    #[instrument(skip_all, fields(identifier = %id))]
    async fn create_lead(&self, company: &Company, id: &CompanyId) -> Result<LeadId, CrmError> {
        let url = self.endpoint("leads");
        let body = LeadRequest::new(company, id);

        let response = http::send_with_rate_limit(
            || {
                self.client
                    .post(&url)
                    .bearer_auth(&self.opts.api_key)
                    .json(&body)
            },
            &self.opts.rate_limit,
            "crm",
        )
        .await
        .map_err(|e| CrmError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        match status {
            s if s.is_success() => {
                let lead_id = match response.json::<Value>().await {
                    Ok(payload) => id_field(&payload, &["id", "lead_id"])
                        .ok_or_else(|| format!("status {s}, body carries no id")),
                    Err(e) => Err(format!("status {s}, unreadable body: {e}")),
                };
                match lead_id {
                    Ok(lead_id) => {
                        info!(lead_id = %lead_id, "lead created");
                        Ok(lead_id)
                    }
                    Err(detail) => {
                        // The next run's 409 reconciles the lead id.
                        error!(
                            status = s.as_u16(),
                            %detail,
                            "lead possibly created but response unusable"
                        );
                        Err(CrmError::Unconfirmed(detail))
                    }
                }
            }
            StatusCode::CONFLICT => {
                let payload: Value = response.json().await.unwrap_or(Value::Null);
                match id_field(&payload, &["existing_id"]) {
                    Some(existing) => {
                        warn!(lead_id = %existing, "lead already exists in CRM; reusing it");
                        Ok(existing)
                    }
                    None => Err(CrmError::AlreadyExists),
                }
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(CrmError::Validation(http::error_snippet(response).await))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CrmError::Upstream {
                status: status.as_u16(),
                message: "CRM API key rejected".into(),
            }),
            _ => Err(CrmError::Upstream {
                status: status.as_u16(),
                message: http::error_snippet(response).await,
            }),
        }
    }
}

/// Lead ids arrive as strings or numbers.
fn id_field(payload: &Value, keys: &[&str]) -> Option<LeadId> {
    keys.iter().find_map(|key| match payload.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(LeadId(s.trim().to_string())),
        Value::Number(n) => Some(LeadId(n.to_string())),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct LeadRequest<'a> {
    source: &'static str,
    status: &'static str,
    priority: &'static str,
    company: LeadCompany<'a>,
    tags: [&'static str; 3],
    custom_fields: CustomFields,
}

#[derive(Debug, Serialize)]
struct LeadCompany<'a> {
    cnpj: String,
    name: &'a str,
    trade_name: Option<&'a str>,
    email: Option<&'a str>,
    phone: Option<&'a str>,
    address: Option<&'a str>,
    city: &'a str,
    state: &'a str,
    zip_code: Option<&'a str>,
    opening_date: String,
    main_activity: Option<&'a str>,
    status: &'a str,
}

#[derive(Debug, Serialize)]
struct CustomFields {
    data_captacao: String,
    fonte_captacao: &'static str,
    segmento: &'static str,
}

impl<'a> LeadRequest<'a> {
    fn new(company: &'a Company, id: &CompanyId) -> Self {
        let opened = company.registered_on.format("%Y-%m-%d").to_string();
        Self {
            source: LEAD_SOURCE,
            status: "new",
            priority: "medium",
            company: LeadCompany {
                cnpj: id.formatted(),
                name: &company.legal_name,
                trade_name: company.trade_name.as_deref(),
                email: company.email.as_deref(),
                phone: company.phone.as_deref(),
                address: company.address.as_deref(),
                city: &company.city,
                state: &company.state,
                zip_code: company.postal_code.as_deref(),
                opening_date: opened.clone(),
                main_activity: company.primary_activity.as_deref(),
                status: &company.status,
            },
            tags: LEAD_TAGS,
            custom_fields: CustomFields {
                data_captacao: opened,
                fonte_captacao: CAPTURE_CHANNEL,
                segmento: SEGMENT,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CrmClient {
        CrmClient::new(CrmClientOptions {
            base_url: server.uri(),
            api_key: "crm-key".into(),
            timeout: Duration::from_secs(5),
            rate_limit: RateLimitPolicy {
                max_retries: 1,
                default_wait: Duration::from_millis(10),
                max_wait: Duration::from_millis(50),
            },
        })
        .unwrap()
    }

    fn company() -> (Company, CompanyId) {
        let company = Company {
            identifier: "11222333000181".into(),
            legal_name: "Padaria Exemplo LTDA".into(),
            trade_name: None,
            email: Some("contato@padaria.com.br".into()),
            phone: None,
            address: None,
            city: "Sao Luis".into(),
            state: "MA".into(),
            postal_code: None,
            registered_on: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            primary_activity: None,
            status: "Ativa".into(),
        };
        let id = CompanyId::normalize(&company.identifier).unwrap();
        (company, id)
    }

    #[tokio::test]
    async fn created_returns_lead_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .and(header("Authorization", "Bearer crm-key"))
            .and(body_partial_json(json!({
                "source": "CNPJá Automation",
                "status": "new",
                "company": {
                    "cnpj": "11.222.333/0001-81",
                    "name": "Padaria Exemplo LTDA",
                    "opening_date": "2024-01-15"
                },
                "tags": ["automacao", "cnpja", "empresa-nova"]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "lead-42" })))
            .expect(1)
            .mount(&server)
            .await;

        let (company, id) = company();
        let lead = client_for(&server).create_lead(&company, &id).await.unwrap();
        assert_eq!(lead, LeadId::from("lead-42"));
    }

    #[tokio::test]
    async fn numeric_lead_id_alias() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "lead_id": 7 })))
            .mount(&server)
            .await;

        let (company, id) = company();
        let lead = client_for(&server).create_lead(&company, &id).await.unwrap();
        assert_eq!(lead.as_str(), "7");
    }

    #[tokio::test]
    async fn created_without_id_is_unconfirmed_and_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "status": "ok" })))
            .expect(1)
            .mount(&server)
            .await;

        let (company, id) = company();
        let err = client_for(&server).create_lead(&company, &id).await.unwrap_err();
        assert!(matches!(err, CrmError::Unconfirmed(_)));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("possibly created"));
    }

    #[tokio::test]
    async fn created_with_unreadable_body_is_unconfirmed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .mount(&server)
            .await;

        let (company, id) = company();
        let err = client_for(&server).create_lead(&company, &id).await.unwrap_err();
        match err {
            CrmError::Unconfirmed(detail) => assert!(detail.contains("unreadable body")),
            other => panic!("expected Unconfirmed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflict_with_existing_id_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({ "existing_id": "lead-1" })),
            )
            .mount(&server)
            .await;

        let (company, id) = company();
        let lead = client_for(&server).create_lead(&company, &id).await.unwrap();
        assert_eq!(lead, LeadId::from("lead-1"));
    }

    #[tokio::test]
    async fn conflict_without_id_is_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let (company, id) = company();
        let err = client_for(&server).create_lead(&company, &id).await.unwrap_err();
        assert!(matches!(err, CrmError::AlreadyExists));
    }

    #[tokio::test]
    async fn rejected_payload_is_validation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(422).set_body_string("name too long"))
            .mount(&server)
            .await;

        let (company, id) = company();
        let err = client_for(&server).create_lead(&company, &id).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("name too long"));
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (company, id) = company();
        let err = client_for(&server).create_lead(&company, &id).await.unwrap_err();
        assert!(matches!(err, CrmError::Upstream { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn persistent_rate_limit_surfaces_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leads"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&server)
            .await;

        let (company, id) = company();
        let err = client_for(&server).create_lead(&company, &id).await.unwrap_err();
        assert!(matches!(err, CrmError::Upstream { status: 429, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_is_network_error() {
        let client = CrmClient::new(CrmClientOptions {
            base_url: "http://127.0.0.1:9".into(),
            api_key: "k".into(),
            timeout: Duration::from_secs(2),
            rate_limit: RateLimitPolicy::with_max_retries(0),
        })
        .unwrap();

        let (company, id) = company();
        let err = client.create_lead(&company, &id).await.unwrap_err();
        assert!(matches!(err, CrmError::Network(_)));
    }
}
