//! A self-signed identity for `localhost`.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};

pub struct Identity {
    cert: CertificateDer<'static>,
    server: Arc<ServerConfig>,
}

impl Identity {
    pub fn localhost() -> Identity {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key.into())
            .unwrap();

        Identity {
            cert,
            server: Arc::new(server),
        }
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server.clone()
    }

    /// A client trusting only this identity.
    pub fn connector(&self) -> proxy_transport::TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).unwrap();
        proxy_transport::TlsConnector::with_root_certificates(roots).unwrap()
    }
}
