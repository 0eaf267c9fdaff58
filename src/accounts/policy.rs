//! Least-privilege policy attached to every provisioned identity.
//!
//! An identity may use its own prefix of the shared storage bucket and manage
//! its own access keys, signing certificates and login profile. Nothing else.

use serde_json::{json, Value};

/// Name under which the policy is attached to `identity`.
pub fn policy_name(identity: &str) -> String {
    format!("{identity}-user")
}

/// Policy document scoped to `identity`'s own namespace.
pub fn identity_policy(identity: &str, storage_bucket: &str) -> Value {
    json!({
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["s3:*"],
                "Resource": format!("arn:aws:s3:::{storage_bucket}/{identity}*"),
            },
            {
                "Effect": "Allow",
                "Action": [
                    "iam:*AccessKey*",
                    "iam:*SigningCert*",
                    "iam:*LoginProf*",
                ],
                "Resource": format!("arn:aws:iam::*:user/{identity}"),
            },
        ]
    })
}
