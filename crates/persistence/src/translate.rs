//! Translation of storage service errors into the persistence taxonomy
//!
//! The service reports most lease conflicts through one generic
//! "precondition failed" response, distinguishable only by its free-text
//! message. Every substring rule lives in [`MESSAGE_RULES`]; no other module
//! inspects error messages.

use persistence_core::Error;

/// The call site an error came from, selecting which rules apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AcquireLease,
    ReleaseLease,
    UploadBlob,
    DownloadBlob,
    DeleteMessage,
}

/// Semantic outcome of a matched rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    BlobAlreadyExists,
    BlobNotFound,
    LeaseAlreadyExists,
    LeaseNotFound,
    MessageNotFound,
}

/// A message pattern: every fragment must appear, in order
struct MessageRule {
    fragments: &'static [&'static str],
    outcome: Outcome,
    reason: &'static str,
    applies_to: &'static [Operation],
}

const BLOB_WRITES: &[Operation] = &[
    Operation::AcquireLease,
    Operation::ReleaseLease,
    Operation::UploadBlob,
];

/// Message rules, checked in order
const MESSAGE_RULES: &[MessageRule] = &[
    MessageRule {
        fragments: &["lease on the blob and no lease ID was specified"],
        outcome: Outcome::LeaseAlreadyExists,
        reason: "a lease ID is required to write a blob with an active lease",
        applies_to: BLOB_WRITES,
    },
    MessageRule {
        fragments: &["no lease on the blob"],
        outcome: Outcome::LeaseNotFound,
        reason: "",
        applies_to: BLOB_WRITES,
    },
    MessageRule {
        fragments: &["lease ID specified did not match"],
        outcome: Outcome::LeaseAlreadyExists,
        reason: "the provided lease ID does not match the active lease",
        applies_to: BLOB_WRITES,
    },
    MessageRule {
        fragments: &["lease", "has expired"],
        outcome: Outcome::LeaseNotFound,
        reason: "",
        applies_to: BLOB_WRITES,
    },
    MessageRule {
        fragments: &["URI does not represent any resource"],
        outcome: Outcome::BlobNotFound,
        reason: "",
        applies_to: &[Operation::DownloadBlob],
    },
    MessageRule {
        fragments: &["pop receipt did not match"],
        outcome: Outcome::MessageNotFound,
        reason: "",
        applies_to: &[Operation::DeleteMessage],
    },
];

/// Outcome for an error class identified by its HTTP status alone
fn status_outcome(operation: Operation, status: u16, code: Option<&str>) -> Option<Outcome> {
    match (operation, status) {
        (Operation::AcquireLease, 409) => Some(Outcome::LeaseAlreadyExists),
        (Operation::AcquireLease | Operation::ReleaseLease, 404) => Some(Outcome::BlobNotFound),
        (Operation::UploadBlob, 409) => Some(Outcome::BlobAlreadyExists),
        // Put Blob with `If-None-Match: *` against an existing blob
        (Operation::UploadBlob, 412) if code == Some("ConditionNotMet") => {
            Some(Outcome::BlobAlreadyExists)
        }
        (Operation::DownloadBlob, 404) => Some(Outcome::BlobNotFound),
        (Operation::DeleteMessage, 404) => Some(Outcome::MessageNotFound),
        _ => None,
    }
}

fn matches_in_order(message: &str, fragments: &[&str]) -> bool {
    let mut rest = message;
    for fragment in fragments {
        match rest.find(fragment) {
            Some(index) => rest = &rest[index + fragment.len()..],
            None => return false,
        }
    }
    true
}

fn message_outcome(operation: Operation, message: &str) -> Option<(Outcome, &'static str)> {
    MESSAGE_RULES
        .iter()
        .filter(|rule| rule.applies_to.contains(&operation))
        .find(|rule| matches_in_order(message, rule.fragments))
        .map(|rule| (rule.outcome, rule.reason))
}

/// Translate an error raised by one backend call
///
/// `resource` names the blob or message involved and ends up in the
/// translated error. Errors that match no rule are returned unchanged.
pub fn translate(error: Error, operation: Operation, resource: &str) -> Error {
    let (outcome, reason) = match &error {
        Error::Service {
            status,
            code,
            message,
        } => match status_outcome(operation, *status, code.as_deref()) {
            Some(outcome) => (outcome, "the lease is held by another client"),
            None => match message_outcome(operation, message) {
                Some(found) => found,
                None => return error,
            },
        },
        _ => return error,
    };

    let resource = resource.to_string();
    match outcome {
        Outcome::BlobAlreadyExists => Error::BlobAlreadyExists { blob: resource },
        Outcome::BlobNotFound => Error::BlobNotFound { blob: resource },
        Outcome::LeaseAlreadyExists => Error::LeaseAlreadyExists {
            blob: resource,
            reason: reason.to_string(),
        },
        Outcome::LeaseNotFound => Error::LeaseNotFound { blob: resource },
        Outcome::MessageNotFound => Error::MessageNotFound {
            message_id: resource,
        },
    }
}
