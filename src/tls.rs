//! TLS listener configuration.
//!
//! Certificate provisioning is external; this only loads the PEM pair
//! named in the config. A missing or unparsable pair is fatal at startup.

use anyhow::Context;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

pub fn build_acceptor(conf: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let certs = {
        let mut reader = BufReader::new(
            File::open(&conf.cert)
                .with_context(|| format!("Failed to open TLS certificate '{}'", conf.cert))?,
        );
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse TLS certificate '{}'", conf.cert))?
    };
    if certs.is_empty() {
        anyhow::bail!("No certificates found in '{}'", conf.cert);
    }

    let key = {
        let mut reader = BufReader::new(
            File::open(&conf.key)
                .with_context(|| format!("Failed to open TLS key '{}'", conf.key))?,
        );
        rustls_pemfile::private_key(&mut reader)
            .with_context(|| format!("Failed to parse TLS key '{}'", conf.key))?
            .ok_or_else(|| anyhow::anyhow!("No private key found in '{}'", conf.key))?
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS certificate/key pair")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
