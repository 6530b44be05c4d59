//! The HTTP client for the M-Pesa Daraja API.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as base64};
use reqwest::{Client, StatusCode, header};
use serde::{Serialize, de::DeserializeOwned};
use time::OffsetDateTime;

use crate::{
    PaymentConfig, UserID,
    credentials::GatewayCredentials,
    timezone::gateway_timestamp,
};

use super::{
    DepositAcknowledgement, DepositRequest, Gateway, GatewayError, StatusQueryOutcome,
    TokenCache, WRONG_CREDENTIALS_CODE, WithdrawalAcknowledgement, WithdrawalRequest,
    payload::{
        AuthResponse, B2CRequest, B2CResponse, ErrorEnvelope, StatusQueryResponse,
        StkPushRequest, StkPushResponse, StkQueryRequest, TransactionStatusRequest,
    },
    TransactionResult,
};

/// The base URL of the sandbox API.
pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
/// The base URL of the production API.
pub const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";
/// How long to wait for the gateway before giving up on a request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const AUTH_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";
const B2C_PATH: &str = "/mpesa/b2c/v1/paymentrequest";
const TRANSACTION_STATUS_PATH: &str = "/mpesa/transactionstatus/v1/query";

/// Where and how [MpesaClient] reaches the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// The API used by credentials with the sandbox flag set.
    pub sandbox_base_url: String,
    /// The API used by all other credentials.
    pub production_base_url: String,
    /// Sent as `CallBackURL` with STK pushes.
    pub deposit_callback_url: String,
    /// Sent as `ResultURL` with B2C requests.
    pub withdrawal_result_url: String,
    /// Sent as `QueueTimeOutURL` with B2C requests.
    pub withdrawal_timeout_url: String,
    /// The canonical timezone request timestamps are written in.
    pub timezone: String,
    /// The timeout for each request.
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Create a config for the public gateway that calls back to the
    /// endpoints of the server described by `payment_config`.
    pub fn new(payment_config: &PaymentConfig, timeout: Duration) -> Self {
        Self {
            sandbox_base_url: SANDBOX_BASE_URL.to_owned(),
            production_base_url: PRODUCTION_BASE_URL.to_owned(),
            deposit_callback_url: payment_config.deposit_callback_url(),
            withdrawal_result_url: payment_config.withdrawal_result_url(),
            withdrawal_timeout_url: payment_config.withdrawal_timeout_url(),
            timezone: payment_config.timezone.clone(),
            timeout,
        }
    }
}

/// A [Gateway] backed by the M-Pesa HTTP API.
#[derive(Debug)]
pub struct MpesaClient {
    http: Client,
    config: GatewayConfig,
    tokens: TokenCache,
}

impl MpesaClient {
    /// Create a client with an empty token cache.
    ///
    /// # Errors
    /// Returns a [GatewayError::Transport] if the HTTP client cannot be built,
    /// e.g. when no TLS backend is available.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| GatewayError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            config,
            tokens: TokenCache::new(),
        })
    }

    fn base_url(&self, credentials: &GatewayCredentials) -> &str {
        if credentials.is_sandbox {
            &self.config.sandbox_base_url
        } else {
            &self.config.production_base_url
        }
    }

    fn timestamp(&self) -> String {
        gateway_timestamp(&self.config.timezone, OffsetDateTime::now_utc())
    }

    async fn post_json<B, R>(
        &self,
        credentials: &GatewayCredentials,
        path: &str,
        body: &B,
    ) -> Result<R, GatewayError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let access_token = self.get_access_token(credentials).await?;
        let url = format!("{}{}", self.base_url(credentials), path);

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let error = rejection(status, &text);
            tracing::error!("Request to {path} failed with {status}: {error}");
            return Err(error);
        }

        serde_json::from_str(&text).map_err(|error| {
            tracing::error!("Could not parse response from {path}: {error}\nbody: {text:?}");
            GatewayError::InvalidResponse(error.to_string())
        })
    }
}

/// The STK push password, base64 of shortcode, passkey and timestamp.
pub(crate) fn stk_password(credentials: &GatewayCredentials, timestamp: &str) -> String {
    base64.encode(format!(
        "{}{}{}",
        credentials.shortcode, credentials.passkey, timestamp
    ))
}

fn transport_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Transport(format!("request timed out: {error}"))
    } else {
        GatewayError::Transport(error.to_string())
    }
}

fn rejection(status: StatusCode, body: &str) -> GatewayError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => GatewayError::Rejected {
            status: status.as_u16(),
            code: envelope.error_code,
            message: envelope.error_message,
        },
        Err(_) => GatewayError::Rejected {
            status: status.as_u16(),
            code: status.as_u16().to_string(),
            message: body.to_owned(),
        },
    }
}

/// Turn a status query response, or rejection, into an outcome.
///
/// The gateway answers queries for transactions it is still processing with
/// the same code it uses for wrong credentials.
fn query_outcome(
    response: Result<StatusQueryResponse, GatewayError>,
) -> Result<StatusQueryOutcome, GatewayError> {
    match response {
        Ok(StatusQueryResponse {
            result_code: Some(result_code),
            result_desc,
            callback_metadata,
            ..
        }) => Ok(StatusQueryOutcome::Resolved(TransactionResult {
            result_code,
            description: result_desc,
            metadata: callback_metadata
                .map(|metadata| metadata.items)
                .unwrap_or_default(),
        })),
        Ok(response) => Ok(StatusQueryOutcome::Pending {
            description: response.response_description,
        }),
        Err(GatewayError::Rejected { code, message, .. }) if code == WRONG_CREDENTIALS_CODE => {
            Ok(StatusQueryOutcome::Pending {
                description: Some(message),
            })
        }
        Err(error) => Err(error),
    }
}

#[async_trait]
impl Gateway for MpesaClient {
    async fn get_access_token(
        &self,
        credentials: &GatewayCredentials,
    ) -> Result<String, GatewayError> {
        if let Some(token) = self
            .tokens
            .get(credentials.user_id, OffsetDateTime::now_utc())
        {
            return Ok(token);
        }

        tracing::info!("Requesting new access token for user {}", credentials.user_id);
        let basic_auth = base64.encode(format!(
            "{}:{}",
            credentials.consumer_key, credentials.consumer_secret
        ));
        let url = format!("{}{}", self.base_url(credentials), AUTH_PATH);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, format!("Basic {basic_auth}"))
            .send()
            .await
            .map_err(|error| GatewayError::Auth(transport_error(error).to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| GatewayError::Auth(error.to_string()))?;

        if !status.is_success() {
            tracing::error!("Failed to get access token: {status} - {text}");
            return Err(GatewayError::Auth(format!("{status}: {text}")));
        }

        let auth_response: AuthResponse = serde_json::from_str(&text)
            .map_err(|error| GatewayError::Auth(format!("unexpected token response: {error}")))?;

        self.tokens.insert(
            credentials.user_id,
            auth_response.access_token.clone(),
            OffsetDateTime::now_utc(),
        );
        tracing::info!("Access token obtained for user {}", credentials.user_id);

        Ok(auth_response.access_token)
    }

    async fn initiate_deposit(
        &self,
        credentials: &GatewayCredentials,
        request: &DepositRequest,
    ) -> Result<DepositAcknowledgement, GatewayError> {
        tracing::info!(
            "STK push for {} - KSh {}",
            request.phone_number,
            request.amount
        );
        let timestamp = self.timestamp();
        let password = stk_password(credentials, &timestamp);

        let body = StkPushRequest {
            business_short_code: &credentials.shortcode,
            password: &password,
            timestamp: &timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount: request.amount,
            party_a: request.phone_number.as_str(),
            party_b: &credentials.shortcode,
            phone_number: request.phone_number.as_str(),
            callback_url: &self.config.deposit_callback_url,
            account_reference: &request.account_reference,
            transaction_desc: &request.description,
        };

        let response: StkPushResponse = self.post_json(credentials, STK_PUSH_PATH, &body).await?;

        if response.response_code != "0" {
            return Err(GatewayError::Rejected {
                status: StatusCode::OK.as_u16(),
                code: response.response_code,
                message: response
                    .response_description
                    .or(response.customer_message)
                    .unwrap_or_default(),
            });
        }

        tracing::info!(
            "STK push initiated: {} / {}",
            response.merchant_request_id,
            response.checkout_request_id
        );

        Ok(DepositAcknowledgement {
            merchant_request_id: response.merchant_request_id,
            checkout_request_id: response.checkout_request_id,
            response_code: response.response_code,
            response_description: response.response_description,
            customer_message: response.customer_message,
        })
    }

    async fn initiate_withdrawal(
        &self,
        credentials: &GatewayCredentials,
        request: &WithdrawalRequest,
    ) -> Result<WithdrawalAcknowledgement, GatewayError> {
        tracing::info!(
            "B2C payment to {} - KSh {}",
            request.phone_number,
            request.amount
        );
        let security_credential = credentials
            .security_credential
            .as_deref()
            .ok_or_else(|| GatewayError::Auth("no security credential configured".to_owned()))?;

        let body = B2CRequest {
            initiator_name: &credentials.initiator_name,
            security_credential,
            command_id: "BusinessPayment",
            amount: request.amount,
            party_a: &credentials.shortcode,
            party_b: request.phone_number.as_str(),
            remarks: &request.remarks,
            queue_timeout_url: &self.config.withdrawal_timeout_url,
            result_url: &self.config.withdrawal_result_url,
            occasion: "Withdrawal",
        };

        let response: B2CResponse = self.post_json(credentials, B2C_PATH, &body).await?;

        if response.response_code != "0" {
            return Err(GatewayError::Rejected {
                status: StatusCode::OK.as_u16(),
                code: response.response_code,
                message: response.response_description.unwrap_or_default(),
            });
        }

        tracing::info!("B2C payment initiated: {}", response.conversation_id);

        Ok(WithdrawalAcknowledgement {
            conversation_id: response.conversation_id,
            originator_conversation_id: response.originator_conversation_id,
            response_code: response.response_code,
            response_description: response.response_description,
        })
    }

    async fn query_deposit_status(
        &self,
        credentials: &GatewayCredentials,
        checkout_request_id: &str,
    ) -> Result<StatusQueryOutcome, GatewayError> {
        let timestamp = self.timestamp();
        let password = stk_password(credentials, &timestamp);

        let body = StkQueryRequest {
            business_short_code: &credentials.shortcode,
            password: &password,
            timestamp: &timestamp,
            checkout_request_id,
        };

        let outcome = query_outcome(self.post_json(credentials, STK_QUERY_PATH, &body).await);
        tracing::info!("STK push query for {checkout_request_id}: {outcome:?}");

        outcome
    }

    async fn query_withdrawal_status(
        &self,
        credentials: &GatewayCredentials,
        conversation_id: &str,
    ) -> Result<StatusQueryOutcome, GatewayError> {
        let security_credential = credentials
            .security_credential
            .as_deref()
            .ok_or_else(|| GatewayError::Auth("no security credential configured".to_owned()))?;

        let body = TransactionStatusRequest {
            conversation_id,
            originator_conversation_id: conversation_id,
            initiator_name: &credentials.initiator_name,
            security_credential,
            command_id: "TransactionStatusQuery",
            transaction_id: conversation_id,
            party_a: &credentials.shortcode,
            identifier_type: "4",
            result_url: &self.config.withdrawal_result_url,
            queue_timeout_url: &self.config.withdrawal_timeout_url,
            remarks: "Transaction status query",
            occasion: "Query",
        };

        let outcome =
            query_outcome(self.post_json(credentials, TRANSACTION_STATUS_PATH, &body).await);
        tracing::info!("B2C status query for {conversation_id}: {outcome:?}");

        outcome
    }

    fn forget_token(&self, owner: UserID) {
        self.tokens.invalidate(owner);
    }
}
