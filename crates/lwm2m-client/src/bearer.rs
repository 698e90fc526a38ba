//! Bearer selection
//!
//! Orders the configured network interfaces by the Preferred
//! Communications Bearer resource of object 13.

use std::net::SocketAddr;

use lwm2m_core::objects::bearer::BEARER_AUTO;

use crate::config::BearerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerCandidate {
    pub name: String,
    pub bearer: i64,
    /// Local address bound for traffic over this bearer
    pub bind: SocketAddr,
}

impl From<&BearerConfig> for BearerCandidate {
    fn from(config: &BearerConfig) -> Self {
        Self {
            name: config.name.clone(),
            bearer: config.bearer,
            bind: config.bind,
        }
    }
}

/// Bearers to try, highest priority first
///
/// `preferred` lists bearer codes in priority order. An Auto entry appends
/// every bearer not listed so far and ends the list. Codes with no
/// configured interface are skipped. When nothing matches, every
/// configured bearer is used in configuration order, and with no bearer
/// configured at all the default bind address is the only candidate.
pub fn candidates(
    preferred: &[i64],
    configured: &[BearerConfig],
    default_bind: SocketAddr,
) -> Vec<BearerCandidate> {
    let mut out: Vec<BearerCandidate> = Vec::new();
    for code in preferred {
        if *code == BEARER_AUTO {
            for bearer in configured {
                if !out.iter().any(|c| c.name == bearer.name) {
                    out.push(bearer.into());
                }
            }
            break;
        }
        for bearer in configured.iter().filter(|b| b.bearer == *code) {
            if !out.iter().any(|c| c.name == bearer.name) {
                out.push(bearer.into());
            }
        }
    }
    if out.is_empty() {
        out = configured.iter().map(BearerCandidate::from).collect();
    }
    if out.is_empty() {
        out.push(BearerCandidate {
            name: "default".to_string(),
            bearer: BEARER_AUTO,
            bind: default_bind,
        });
    }
    out
}
