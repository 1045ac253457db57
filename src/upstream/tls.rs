// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Shared rustls client configuration for the DoT and DoH transports.

use once_cell::sync::Lazy;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName,
};
use std::{sync::Arc, time::SystemTime};

static WEBPKI_ROOTS: Lazy<RootCertStore> = Lazy::new(|| {
    let mut root_store = RootCertStore::empty();
    root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    root_store
});

pub(super) fn create_client_config(
    root_cas: Option<RootCertStore>,
    insecure_skip_verify: bool,
) -> ClientConfig {
    let mut client_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_cas.unwrap_or_else(|| WEBPKI_ROOTS.clone()))
        .with_no_client_auth();

    if insecure_skip_verify {
        // Test-only escape hatch.
        client_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    client_config
}

struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
