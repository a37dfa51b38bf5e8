use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{MessageAttributeValue, MessageSystemAttributeName, SendMessageBatchRequestEntry};
use tracing::warn;

use super::{
    Attribute, BatchEntry, BatchFailure, BatchSendOutput, Message, MessageTransport, ReceiveOptions,
    SendRequest, TransportError,
};
use crate::client::{SqsClientConfig, create_sqs_client, create_sqs_client_from_env};

/// Error codes SQS uses to signal that the caller should slow down.
const THROTTLING_CODES: &[&str] = &[
    "OverLimit",
    "AWS.SimpleQueueService.OverLimit",
    "ThrottlingException",
    "RequestThrottled",
    "AWS.SimpleQueueService.RequestThrottled",
    "KmsThrottled",
];

const NON_EXISTENT_QUEUE_CODES: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
];

/// [`MessageTransport`] backed by an `aws_sdk_sqs::Client`.
///
/// The SDK client is cheap to clone and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct SqsTransport {
    client: aws_sdk_sqs::Client,
}

impl SqsTransport {
    pub fn new(client: aws_sdk_sqs::Client) -> Self {
        SqsTransport { client }
    }

    pub async fn from_env() -> Self {
        SqsTransport::new(create_sqs_client_from_env().await)
    }

    pub async fn from_config(config: &SqsClientConfig) -> Self {
        SqsTransport::new(create_sqs_client(config).await)
    }

    pub fn client(&self) -> &aws_sdk_sqs::Client {
        &self.client
    }
}

#[async_trait]
impl MessageTransport for SqsTransport {
    async fn receive(
        &self,
        queue_url: &str,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, TransportError> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(options.max_number_of_messages)
            .wait_time_seconds(options.wait_time_seconds)
            .message_attribute_names("All")
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| classify_sdk_error("receive_message", e))?;

        let mut messages = Vec::with_capacity(output.messages().len());
        for message in output.messages() {
            let Some(receipt_handle) = message.receipt_handle() else {
                warn!(queue_url = %queue_url, "Received a message without receipt handle, skipping");
                continue;
            };

            let mut attributes = HashMap::new();
            if let Some(system) = message.attributes() {
                for (name, value) in system {
                    attributes.insert(name.as_str().to_string(), value.clone());
                }
            }
            if let Some(custom) = message.message_attributes() {
                for (key, value) in custom {
                    if let Some(string_value) = value.string_value() {
                        attributes.insert(key.clone(), string_value.to_string());
                    }
                }
            }

            messages.push(Message {
                id: message.message_id().unwrap_or_default().to_string(),
                receipt_handle: receipt_handle.to_string(),
                body: message.body().unwrap_or_default().to_string(),
                attributes,
            });
        }

        Ok(messages)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), TransportError> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| classify_sdk_error("delete_message", e))?;
        Ok(())
    }

    async fn send(&self, request: &SendRequest) -> Result<String, TransportError> {
        let mut builder = self
            .client
            .send_message()
            .queue_url(&request.queue_url)
            .message_body(&request.body);
        for attribute in &request.attributes {
            builder = builder.message_attributes(
                attribute.key.clone(),
                attribute_value("send_message", attribute)?,
            );
        }

        let output = builder
            .send()
            .await
            .map_err(|e| classify_sdk_error("send_message", e))?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }

    async fn send_batch(
        &self,
        queue_url: &str,
        entries: &[BatchEntry],
    ) -> Result<BatchSendOutput, TransportError> {
        let mut request_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut builder = SendMessageBatchRequestEntry::builder()
                .id(&entry.id)
                .message_body(&entry.body);
            for attribute in &entry.attributes {
                builder = builder.message_attributes(
                    attribute.key.clone(),
                    attribute_value("send_message_batch", attribute)?,
                );
            }
            let request_entry = builder
                .build()
                .map_err(|e| TransportError::service("send_message_batch", e.to_string()))?;
            request_entries.push(request_entry);
        }

        let output = self
            .client
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(request_entries))
            .send()
            .await
            .map_err(|e| classify_sdk_error("send_message_batch", e))?;

        Ok(BatchSendOutput {
            successful: output.successful().iter().map(|s| s.id().to_string()).collect(),
            failed: output
                .failed()
                .iter()
                .map(|f| BatchFailure {
                    id: f.id().to_string(),
                    code: f.code().to_string(),
                    message: f.message().map(str::to_string),
                })
                .collect(),
        })
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: Duration,
    ) -> Result<(), TransportError> {
        let seconds = i32::try_from(visibility_timeout.as_secs()).unwrap_or(i32::MAX);
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds)
            .send()
            .await
            .map_err(|e| classify_sdk_error("change_message_visibility", e))?;
        Ok(())
    }
}

fn attribute_value(
    operation: &'static str,
    attribute: &Attribute,
) -> Result<MessageAttributeValue, TransportError> {
    MessageAttributeValue::builder()
        .data_type(&attribute.data_type)
        .string_value(&attribute.value)
        .build()
        .map_err(|e| TransportError::service(operation, e.to_string()))
}

fn classify_sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> TransportError
where
    E: ProvideErrorMetadata + Debug,
    R: Debug,
{
    match &err {
        SdkError::ServiceError(context) => {
            classify_code(operation, context.err().code(), context.err().message())
        }
        SdkError::TimeoutError(_) => TransportError::Service {
            operation,
            code: Some("timeout".to_string()),
            message: "request timed out".to_string(),
        },
        _ => TransportError::service(operation, format!("{err:?}")),
    }
}

/// Maps an SQS error code to a [`TransportError`].
pub(crate) fn classify_code(
    operation: &'static str,
    code: Option<&str>,
    message: Option<&str>,
) -> TransportError {
    let message = message.unwrap_or("no error message").to_string();
    match code {
        Some(code) if THROTTLING_CODES.contains(&code) => TransportError::Throttled(message),
        Some(code) if NON_EXISTENT_QUEUE_CODES.contains(&code) => {
            TransportError::QueueDoesNotExist(message)
        }
        code => TransportError::Service {
            operation,
            code: code.map(str::to_string),
            message,
        },
    }
}
