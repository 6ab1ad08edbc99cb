use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque string id. The value is kept verbatim; ember never parses it.
macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the id is empty or whitespace only.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

opaque_id!(
    /// Application session id, normally assigned by the caller.
    SessionId
);
opaque_id!(
    /// Job id assigned by the job service.
    JobId
);

impl SessionId {
    /// A fresh, time-ordered id for callers that don't bring their own.
    pub fn generate() -> Self {
        Self(format!("sess_{}", Uuid::now_v7()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_id_is_usable() {
        let id = SessionId::default();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
        assert!(!id.is_blank());
        assert_ne!(id, SessionId::generate());
    }

    #[test]
    fn caller_ids_kept_verbatim() {
        let id = SessionId::from_raw(" coach-call/42 ");
        assert_eq!(id.as_str(), " coach-call/42 ");
        assert_eq!(id.to_string(), " coach-call/42 ");
        assert!(!id.is_blank());
    }

    #[test]
    fn blank_detection() {
        assert!(SessionId::from_raw("").is_blank());
        assert!(SessionId::from_raw("  \t").is_blank());
        assert!(!SessionId::from_raw("s1").is_blank());
    }

    #[test]
    fn runpod_job_id_serializes_as_plain_string() {
        let id = JobId::from_raw("c80ffee4-f10f-4b36-a1e9-6b1f4a3c7a8d-u1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"c80ffee4-f10f-4b36-a1e9-6b1f4a3c7a8d-u1\"");
        let parsed: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
