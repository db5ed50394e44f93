//! Email notifier: sends the contact email through the provider's send API.

use std::time::Duration;

use async_trait::async_trait;
use leadflow_shared::{Company, CompanyId, DeliveryOutcome, NotifierConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::http::{self, RateLimitPolicy};
use crate::{ConnectorError, ContactNotifier};

const EMAIL_TAGS: [&str; 3] = ["automacao", "lead", "contabil"];
const CAPTURE_SOURCE: &str = "cnpja_automation";

/// Settings for [`EmailNotifier`].
#[derive(Debug, Clone)]
pub struct EmailNotifierOptions {
    pub base_url: String,
    /// Sent as a bearer token.
    pub token: String,
    pub timeout: Duration,
    pub sender_email: String,
    pub sender_name: String,
    pub template_id: String,
    pub rate_limit: RateLimitPolicy,
}

impl EmailNotifierOptions {
    pub fn from_config(config: &NotifierConfig, token: String, max_retries: u32) -> Self {
        Self {
            base_url: config.base_url.clone(),
            token,
            timeout: Duration::from_secs(config.timeout_secs),
            sender_email: config.sender_email.clone(),
            sender_name: config.sender_name.clone(),
            template_id: config.template_id.clone(),
            rate_limit: RateLimitPolicy::with_max_retries(max_retries),
        }
    }
}

/// HTTP implementation of [`ContactNotifier`].
pub struct EmailNotifier {
    client: Client,
    opts: EmailNotifierOptions,
}

impl EmailNotifier {
    pub fn new(opts: EmailNotifierOptions) -> Result<Self, ConnectorError> {
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
            .bearer_auth(&self.opts.token)
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
impl ContactNotifier for EmailNotifier {
    #[instrument(skip_all, fields(identifier = %id))]
    async fn send_contact_email(&self, company: &Company, id: &CompanyId) -> DeliveryOutcome {
        let Some(recipient) = company.email.as_deref() else {
            debug!("no contact email on record");
            return DeliveryOutcome::NoRecipient;
        };

        let url = self.endpoint("emails/send");
        let html = render_contact_email(company, recipient, &self.opts.sender_email);
        let body = SendRequest::new(company, id, recipient, &html, &self.opts);

        let response = match http::send_with_rate_limit(
            || {
                self.client
                    .post(&url)
                    .bearer_auth(&self.opts.token)
                    .json(&body)
            },
            &self.opts.rate_limit,
            "notifier",
        )
        .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "contact email not sent");
                return DeliveryOutcome::Failed {
                    reason: format!("network error: {e}"),
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = http::error_snippet(response).await;
            warn!(status = status.as_u16(), detail = %detail, "contact email rejected");
            return DeliveryOutcome::Failed {
                reason: format!("HTTP {}: {detail}", status.as_u16()),
            };
        }

        let message_id = response
            .json::<SendResponse>()
            .await
            .ok()
            .and_then(|r| r.message_id);
        info!(message_id = ?message_id, "contact email sent");
        DeliveryOutcome::Sent { message_id }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    to: [Mailbox<'a>; 1],
    subject: String,
    html_content: &'a str,
    sender: Mailbox<'a>,
    template_id: &'a str,
    tags: [&'static str; 3],
    tracking: Tracking,
    custom_data: CustomData,
}

#[derive(Debug, Serialize)]
struct Mailbox<'a> {
    email: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct Tracking {
    opens: bool,
    clicks: bool,
    unsubscribe: bool,
}

#[derive(Debug, Serialize)]
struct CustomData {
    cnpj: String,
    fonte: &'static str,
    data_captacao: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    message_id: Option<String>,
}

impl<'a> SendRequest<'a> {
    fn new(
        company: &'a Company,
        id: &CompanyId,
        recipient: &'a str,
        html: &'a str,
        opts: &'a EmailNotifierOptions,
    ) -> Self {
        Self {
            to: [Mailbox {
                email: recipient,
                name: company.display_name(),
            }],
            subject: format!("Oportunidade de Parceria - {}", company.legal_name),
            html_content: html,
            sender: Mailbox {
                email: &opts.sender_email,
                name: &opts.sender_name,
            },
            template_id: &opts.template_id,
            tags: EMAIL_TAGS,
            tracking: Tracking {
                opens: true,
                clicks: true,
                unsubscribe: true,
            },
            custom_data: CustomData {
                cnpj: id.to_string(),
                fonte: CAPTURE_SOURCE,
                data_captacao: company.registered_on.format("%Y-%m-%d").to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// Render the congratulation email for a newly opened company.
pub fn render_contact_email(company: &Company, recipient: &str, contact_email: &str) -> String {
    let name = escape_html(company.display_name());
    let recipient = escape_html(recipient);
    let contact = escape_html(contact_email);

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>Ikasa Contabilidade</title></head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
<div style="max-width: 600px; margin: 0 auto; padding: 20px;">
<h2 style="color: #2c5aa0;">Parabéns pela abertura da {name}!</h2>
<p>Olá,</p>
<p>Soubemos que a <strong>{name}</strong> foi recentemente constituída e gostaríamos de parabenizá-los por este importante passo!</p>
<p>A <strong>Ikasa Contabilidade</strong> é especializada em atender empresas em início de atividade, oferecendo:</p>
<ul>
<li>Contabilidade completa e personalizada</li>
<li>Assessoria fiscal e tributária</li>
<li>Folha de pagamento e eSocial</li>
<li>Consultoria empresarial</li>
<li>Suporte completo para MEI, ME e EPP</li>
</ul>
<div style="background-color: #f8f9fa; padding: 15px; border-left: 4px solid #2c5aa0; margin: 20px 0;">
<p style="margin: 0;"><strong>Primeira consulta GRATUITA</strong></p>
<p style="margin: 5px 0 0 0;">Análise completa da sua situação fiscal e tributária</p>
</div>
<p>Estamos ansiosos para fazer parte do sucesso da {name}! Fale conosco em {contact}.</p>
<p>Atenciosamente,<br><strong>Equipe Ikasa Contabilidade</strong></p>
<hr style="margin: 30px 0; border: none; border-top: 1px solid #eee;">
<div style="font-size: 12px; color: #666; text-align: center;">
<p>Este e-mail foi enviado para {recipient}</p>
<p>Se não deseja mais receber nossos e-mails, <a href="{{{{unsubscribe_url}}}}">clique aqui</a></p>
</div>
</div>
</body>
</html>
"#
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
