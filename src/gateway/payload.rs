//! The JSON bodies exchanged with the gateway.
//!
//! Field names follow the gateway's API exactly. Inbound callbacks are parsed
//! leniently: every field is optional, result codes may be numbers or strings,
//! and both the flat body and the gateway's nested envelopes are accepted.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ============================================================================
// RESULTS
// ============================================================================

/// A name/value pair from the metadata list attached to a transaction result.
///
/// STK results name items with `Name` and B2C results with `Key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawMetadataItem")]
pub struct MetadataItem {
    /// The item name, e.g. "MpesaReceiptNumber".
    #[serde(rename = "Name")]
    pub name: String,
    /// The item value, which the gateway sends as either a string or a number.
    #[serde(rename = "Value")]
    pub value: Option<Value>,
}

#[derive(Deserialize)]
struct RawMetadataItem {
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "Key", default)]
    key: Option<String>,
    #[serde(rename = "Value", default)]
    value: Option<Value>,
}

impl From<RawMetadataItem> for MetadataItem {
    fn from(raw: RawMetadataItem) -> Self {
        Self {
            name: raw.name.or(raw.key).unwrap_or_default(),
            value: raw.value,
        }
    }
}

impl MetadataItem {
    /// Create a metadata item with a string value.
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_owned(),
            value: Some(Value::String(value.to_owned())),
        }
    }
}

/// Get the value of the first metadata item called `name` as a string.
///
/// Missing items, null values and empty strings are all treated as absent.
pub fn metadata_value(items: &[MetadataItem], name: &str) -> Option<String> {
    let item = items.iter().find(|item| item.name == name)?;

    match item.value.as_ref()? {
        Value::String(value) if !value.is_empty() => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

/// The final outcome of a transaction as reported by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    /// Zero for success, anything else is a failure.
    pub result_code: i64,
    /// The gateway's description of the result.
    pub description: Option<String>,
    /// Details of the completed transaction, e.g. the receipt number.
    pub metadata: Vec<MetadataItem>,
}

impl TransactionResult {
    /// Whether the transaction succeeded.
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

/// A metadata list as it appears in callback and query bodies.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CallbackMetadata {
    /// The metadata items.
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    Text(String),
}

/// Deserialize a result code that may be sent as `0` or `"0"`.
///
/// A string that is not an integer is treated as an unknown failure code.
fn deserialize_result_code<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let code = Option::<NumberOrString>::deserialize(deserializer)?;

    Ok(code.map(|code| match code {
        NumberOrString::Number(code) => code,
        NumberOrString::Text(code) => code.trim().parse().unwrap_or(UNKNOWN_RESULT_CODE),
    }))
}

/// The result code assumed when the gateway omits or garbles one.
pub const UNKNOWN_RESULT_CODE: i64 = 1;

// ============================================================================
// AUTH
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct AuthResponse {
    pub access_token: String,
}

/// The body of a rejected request.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    #[serde(rename = "errorCode")]
    pub error_code: String,
    #[serde(rename = "errorMessage", default)]
    pub error_message: String,
}

// ============================================================================
// DEPOSITS (STK PUSH)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct StkPushRequest<'a> {
    pub business_short_code: &'a str,
    pub password: &'a str,
    pub timestamp: &'a str,
    pub transaction_type: &'a str,
    pub amount: u64,
    pub party_a: &'a str,
    pub party_b: &'a str,
    pub phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    pub callback_url: &'a str,
    pub account_reference: &'a str,
    pub transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: Option<String>,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct StkQueryRequest<'a> {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: &'a str,
    #[serde(rename = "Password")]
    pub password: &'a str,
    #[serde(rename = "Timestamp")]
    pub timestamp: &'a str,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: &'a str,
}

/// The response to a status query, for either kind of transaction.
///
/// Only carries a result code once the transaction has been resolved.
#[derive(Debug, Deserialize)]
pub(crate) struct StatusQueryResponse {
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: Option<String>,
    #[serde(rename = "ResultCode", default, deserialize_with = "deserialize_result_code")]
    pub result_code: Option<i64>,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

/// The result of an STK push, as posted to the deposit callback URL.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StkCallback {
    /// The first half of the correlation pair.
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    /// The second half of the correlation pair, which identifies the deposit.
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,
    /// Zero for success.
    #[serde(rename = "ResultCode", default, deserialize_with = "deserialize_result_code")]
    pub result_code: Option<i64>,
    /// The gateway's description of the result.
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
    /// Receipt details, only present on success.
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Deserialize)]
struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StkCallbackEnvelope {
    Nested {
        #[serde(rename = "Body")]
        body: StkCallbackBody,
    },
    Flat(StkCallback),
}

impl StkCallback {
    /// Parse a callback body in either the flat or the `Body.stkCallback` form.
    ///
    /// # Errors
    /// Returns an error if `body` is not a JSON object.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: StkCallbackEnvelope = serde_json::from_slice(body)?;

        Ok(match envelope {
            StkCallbackEnvelope::Nested { body } => body.stk_callback,
            StkCallbackEnvelope::Flat(callback) => callback,
        })
    }

    /// The transaction result carried by the callback.
    ///
    /// A missing result code is treated as a failure.
    pub fn result(&self) -> TransactionResult {
        TransactionResult {
            result_code: self.result_code.unwrap_or(UNKNOWN_RESULT_CODE),
            description: self.result_desc.clone(),
            metadata: self
                .callback_metadata
                .clone()
                .map(|metadata| metadata.items)
                .unwrap_or_default(),
        }
    }
}

// ============================================================================
// WITHDRAWALS (B2C)
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct B2CRequest<'a> {
    #[serde(rename = "InitiatorName")]
    pub initiator_name: &'a str,
    #[serde(rename = "SecurityCredential")]
    pub security_credential: &'a str,
    #[serde(rename = "CommandID")]
    pub command_id: &'a str,
    #[serde(rename = "Amount")]
    pub amount: u64,
    #[serde(rename = "PartyA")]
    pub party_a: &'a str,
    #[serde(rename = "PartyB")]
    pub party_b: &'a str,
    #[serde(rename = "Remarks")]
    pub remarks: &'a str,
    #[serde(rename = "QueueTimeOutURL")]
    pub queue_timeout_url: &'a str,
    #[serde(rename = "ResultURL")]
    pub result_url: &'a str,
    #[serde(rename = "Occasion")]
    pub occasion: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct B2CResponse {
    #[serde(rename = "ConversationID")]
    pub conversation_id: String,
    #[serde(rename = "OriginatorConversationID", default)]
    pub originator_conversation_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TransactionStatusRequest<'a> {
    #[serde(rename = "ConversationID")]
    pub conversation_id: &'a str,
    #[serde(rename = "OriginatorConversationID")]
    pub originator_conversation_id: &'a str,
    #[serde(rename = "InitiatorName")]
    pub initiator_name: &'a str,
    #[serde(rename = "SecurityCredential")]
    pub security_credential: &'a str,
    #[serde(rename = "CommandID")]
    pub command_id: &'a str,
    #[serde(rename = "TransactionID")]
    pub transaction_id: &'a str,
    #[serde(rename = "PartyA")]
    pub party_a: &'a str,
    #[serde(rename = "IdentifierType")]
    pub identifier_type: &'a str,
    #[serde(rename = "ResultURL")]
    pub result_url: &'a str,
    #[serde(rename = "QueueTimeOutURL")]
    pub queue_timeout_url: &'a str,
    #[serde(rename = "Remarks")]
    pub remarks: &'a str,
    #[serde(rename = "Occasion")]
    pub occasion: &'a str,
}

/// The result of a B2C payment, as posted to the result or timeout URL.
#[derive(Debug, Clone, PartialEq)]
pub struct B2CCallback {
    /// The correlation ID which identifies the withdrawal.
    pub conversation_id: Option<String>,
    /// The gateway's secondary correlation ID.
    pub originator_conversation_id: Option<String>,
    /// The outcome, a missing result code is treated as a failure.
    pub result: TransactionResult,
}

#[derive(Deserialize)]
struct FlatB2CCallback {
    #[serde(rename = "ConversationID", default)]
    conversation_id: Option<String>,
    #[serde(rename = "OriginatorConversationID", default)]
    originator_conversation_id: Option<String>,
    #[serde(rename = "ResultCode", default, deserialize_with = "deserialize_result_code")]
    result_code: Option<i64>,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "TransactionID", default)]
    transaction_id: Option<String>,
    #[serde(rename = "TransactionId", default)]
    transaction_id_lowercase: Option<String>,
    #[serde(rename = "MpesaReceiptNumber", default)]
    receipt_number: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Deserialize)]
struct ResultParameters {
    #[serde(rename = "ResultParameter", default)]
    items: Vec<MetadataItem>,
}

#[derive(Deserialize)]
struct NestedB2CResult {
    #[serde(rename = "ConversationID", default)]
    conversation_id: Option<String>,
    #[serde(rename = "OriginatorConversationID", default)]
    originator_conversation_id: Option<String>,
    #[serde(rename = "ResultCode", default, deserialize_with = "deserialize_result_code")]
    result_code: Option<i64>,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "TransactionID", default)]
    transaction_id: Option<String>,
    #[serde(rename = "ResultParameters", default)]
    result_parameters: Option<ResultParameters>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum B2CCallbackEnvelope {
    Nested {
        #[serde(rename = "Result")]
        result: NestedB2CResult,
    },
    Flat(FlatB2CCallback),
}

/// Add a top level value to the metadata unless the metadata already has it.
fn push_metadata(items: &mut Vec<MetadataItem>, name: &str, value: Option<String>) {
    match value {
        Some(value) if metadata_value(items, name).is_none() => {
            items.push(MetadataItem::new(name, &value));
        }
        _ => {}
    }
}

impl B2CCallback {
    /// Parse a B2C result or timeout body in either the flat or the `Result`
    /// form.
    ///
    /// # Errors
    /// Returns an error if `body` is not a JSON object.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: B2CCallbackEnvelope = serde_json::from_slice(body)?;

        Ok(match envelope {
            B2CCallbackEnvelope::Nested { result } => {
                let mut metadata = result
                    .result_parameters
                    .map(|parameters| parameters.items)
                    .unwrap_or_default();
                push_metadata(&mut metadata, "TransactionID", result.transaction_id);

                Self {
                    conversation_id: result.conversation_id,
                    originator_conversation_id: result.originator_conversation_id,
                    result: TransactionResult {
                        result_code: result.result_code.unwrap_or(UNKNOWN_RESULT_CODE),
                        description: result.result_desc,
                        metadata,
                    },
                }
            }
            B2CCallbackEnvelope::Flat(callback) => {
                let mut metadata = callback
                    .callback_metadata
                    .map(|metadata| metadata.items)
                    .unwrap_or_default();
                push_metadata(
                    &mut metadata,
                    "TransactionID",
                    callback.transaction_id.or(callback.transaction_id_lowercase),
                );
                push_metadata(&mut metadata, "MpesaReceiptNumber", callback.receipt_number);

                Self {
                    conversation_id: callback.conversation_id,
                    originator_conversation_id: callback.originator_conversation_id,
                    result: TransactionResult {
                        result_code: callback.result_code.unwrap_or(UNKNOWN_RESULT_CODE),
                        description: callback.result_desc,
                        metadata,
                    },
                }
            }
        })
    }
}
