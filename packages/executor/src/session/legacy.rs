//! HTTP client construction for remote management endpoints.
//!
//! Two variants exist per endpoint:
//!
//! - **modern**: TLS ≥ 1.2, the default for current controller firmware.
//! - **legacy**: TLS ≥ 1.0 with hostname verification off and HTTP/1.1
//!   forced, for old out-of-band controllers whose firmware predates
//!   modern TLS. Strictly opt-in: a caller selects it only after a modern
//!   handshake has already failed against a known class of old hardware.
//!
//! Certificate verification is disabled in both variants unless configured
//! otherwise; the fleet runs self-signed certificates throughout.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::tls::Version;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_client(legacy_tls: bool, verify_tls: bool) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .danger_accept_invalid_certs(!verify_tls);

    if legacy_tls {
        builder = builder
            .use_native_tls()
            .min_tls_version(Version::TLS_1_0)
            .danger_accept_invalid_hostnames(true)
            .http1_only();
    } else {
        builder = builder.min_tls_version(Version::TLS_1_2);
    }

    builder.build().context("failed to build remote HTTP client")
}
