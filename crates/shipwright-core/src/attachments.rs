//! Attachment resolution
//!
//! Attachments arrive either inline as `data:` URIs or as remote addresses.
//! Each one is resolved to raw bytes once per task.

use crate::backend::AttachmentFetcher;
use crate::error::{CallError, PipelineError, RetryError};
use crate::retry::{retry, Idempotency, RetryPolicy};
use crate::types::{Attachment, ResolvedAttachment};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use url::Url;

/// Where an attachment's bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    /// Bytes carried in the reference itself
    Inline {
        /// Declared media type
        media_type: Option<String>,
        /// Decoded bytes
        bytes: Vec<u8>,
    },
    /// Bytes to download
    Remote(Url),
}

/// Classify and, for inline data, decode an attachment reference
///
/// # Errors
/// `CallError::Permanent` for malformed `data:` URIs, bad base64, or
/// addresses that are neither `data:` nor http(s).
pub fn parse_source(reference: &str) -> Result<AttachmentSource, CallError> {
    if let Some(rest) = reference.strip_prefix("data:") {
        let (header, data) = rest
            .split_once(',')
            .ok_or_else(|| CallError::permanent("data uri without ',' separator"))?;

        let mut params = header.split(';');
        let media_type = params
            .next()
            .filter(|m| !m.is_empty())
            .map(str::to_string);
        let is_base64 = params.any(|p| p.eq_ignore_ascii_case("base64"));

        let bytes = if is_base64 {
            STANDARD
                .decode(data.trim())
                .map_err(|e| CallError::permanent(format!("invalid base64 payload: {e}")))?
        } else {
            data.as_bytes().to_vec()
        };
        return Ok(AttachmentSource::Inline { media_type, bytes });
    }

    let url = Url::parse(reference)
        .map_err(|e| CallError::permanent(format!("invalid attachment address: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(AttachmentSource::Remote(url)),
        other => Err(CallError::permanent(format!(
            "unsupported attachment scheme '{other}'"
        ))),
    }
}

/// Resolve every attachment of a task
///
/// Remote downloads go through the retry executor with `policy`.
///
/// # Errors
/// `PipelineError::Attachment` naming the first attachment that could not be
/// resolved.
pub async fn resolve_all(
    attachments: &[Attachment],
    fetcher: &dyn AttachmentFetcher,
    policy: &RetryPolicy,
) -> Result<Vec<ResolvedAttachment>, PipelineError> {
    let mut resolved = Vec::with_capacity(attachments.len());

    for attachment in attachments {
        let failed = |source: RetryError| PipelineError::Attachment {
            name: attachment.name.clone(),
            source,
        };

        let source = parse_source(&attachment.url).map_err(|error| failed(RetryError {
            error,
            attempts: 0,
        }))?;

        let (media_type, bytes) = match source {
            AttachmentSource::Inline { media_type, bytes } => (media_type, bytes),
            AttachmentSource::Remote(url) => {
                let fetched = retry("attachment", policy, Idempotency::Idempotent, |_| {
                    fetcher.fetch(&url)
                })
                .await
                .map_err(failed)?;
                (None, fetched.value)
            }
        };

        tracing::debug!(name = %attachment.name, bytes = bytes.len(), "attachment resolved");
        resolved.push(ResolvedAttachment {
            name: attachment.name.clone(),
            media_type,
            bytes,
        });
    }

    Ok(resolved)
}
