//! ZAP agent: the in-process authorization endpoint.
//!
//! The transport library funnels every inbound CURVE handshake through a
//! request on `inproc://zeromq.zap.01`. The agent binds a REP socket there,
//! decodes the 7-frame request, looks the client's public key up in the
//! certificate store, and answers `200 OK` (user id = the key's Z85 text)
//! or `400 No access`.
//!
//! One agent per transport context; a second enable fails with `EEXIST`.

use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

use canopy_core::error::{Error, Result};
use canopy_core::reactor::Reactor;

use crate::cert::CertStore;
use crate::transport::{TransportContext, ZmqWatcher};

/// The rendezvous endpoint fixed by the transport library.
pub const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";

const ZAP_VERSION: &str = "1.0";

/// The in-process ZAP responder. Serviced by the reactor; lives as long as
/// the transport does.
pub struct ZapAgent {
    watcher: ZmqWatcher,
    store: Rc<RefCell<CertStore>>,
}

impl std::fmt::Debug for ZapAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZapAgent").finish_non_exhaustive()
    }
}

impl ZapAgent {
    /// Bind the agent and start servicing requests. Fails with `EEXIST` if
    /// the context already has an agent.
    pub fn new(
        tc: &TransportContext,
        reactor: &Reactor,
        store: Rc<RefCell<CertStore>>,
    ) -> Result<Self> {
        tc.claim_zap()?;
        let sock = tc
            .context()
            .socket(zmq::REP)
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e.to_raw())))?;
        sock.bind(ZAP_ENDPOINT)
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e.to_raw())))?;
        debug!("[zap] agent listening on {ZAP_ENDPOINT}");

        let sock = Rc::new(sock);
        let cb_sock = sock.clone();
        let cb_store = store.clone();
        let watcher = ZmqWatcher::new(
            reactor,
            sock.clone(),
            Box::new(move |_| loop {
                let frames = match cb_sock.recv_multipart(zmq::DONTWAIT) {
                    Ok(frames) => frames,
                    Err(zmq::Error::EAGAIN) => break,
                    Err(e) => {
                        warn!(error = %e, "[zap] receive failed");
                        break;
                    }
                };
                let reply = respond(&cb_store.borrow(), &frames);
                if let Err(e) = cb_sock.send_multipart(reply.iter().map(String::as_bytes), 0) {
                    warn!(error = %e, "[zap] reply failed");
                }
            }),
        )?;
        watcher.start()?;
        Ok(Self { watcher, store })
    }

    /// The certificate store this agent consults.
    #[must_use]
    pub fn store(&self) -> Rc<RefCell<CertStore>> {
        self.store.clone()
    }

    pub fn shutdown(&self) {
        self.watcher.destroy();
    }
}

/// Build the 6-frame ZAP reply for one request.
fn respond(store: &CertStore, frames: &[Vec<u8>]) -> [String; 6] {
    let request_id = frames
        .get(1)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .unwrap_or_default();

    let deny = |id: String, text: &str| -> [String; 6] {
        [
            ZAP_VERSION.to_string(),
            id,
            "400".to_string(),
            text.to_string(),
            String::new(),
            String::new(),
        ]
    };

    if frames.len() != 7 {
        warn!(frames = frames.len(), "[zap] malformed request");
        return deny(request_id, "No access");
    }
    if frames[0] != ZAP_VERSION.as_bytes() {
        return deny(request_id, "Invalid version");
    }
    if frames[5] != b"CURVE" {
        return deny(request_id, "Security mechanism not supported");
    }
    let key = &frames[6];
    if key.len() != crate::cert::KEY_SIZE {
        return deny(request_id, "No access");
    }
    let key_txt = zmq::z85_encode(key).expect("32 bytes is z85-encodable");
    match store.lookup(&key_txt) {
        Some(name) => {
            debug!(name, "[zap] authorized");
            [
                ZAP_VERSION.to_string(),
                request_id,
                "200".to_string(),
                "OK".to_string(),
                key_txt,
                String::new(),
            ]
        }
        None => {
            warn!(key = %key_txt, "[zap] denied");
            deny(request_id, "No access")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::Certificate;

    fn curve_request(key: &[u8], mechanism: &[u8]) -> Vec<Vec<u8>> {
        vec![
            b"1.0".to_vec(),
            b"1".to_vec(),
            b"overlay".to_vec(),
            b"127.0.0.1".to_vec(),
            Vec::new(),
            mechanism.to_vec(),
            key.to_vec(),
        ]
    }

    #[test]
    fn authorized_key_gets_200_with_key_text() {
        let mut store = CertStore::new();
        let cert = Certificate::generate("child").unwrap();
        store.authorize("child", cert.public_key());

        let reply = respond(&store, &curve_request(cert.public_key().as_bytes(), b"CURVE"));
        assert_eq!(reply[2], "200");
        assert_eq!(reply[3], "OK");
        assert_eq!(reply[4], cert.public_key().to_z85());
    }

    #[test]
    fn unknown_key_gets_400() {
        let store = CertStore::new();
        let reply = respond(&store, &curve_request(&[7u8; 32], b"CURVE"));
        assert_eq!(reply[2], "400");
        assert_eq!(reply[3], "No access");
        assert_eq!(reply[4], "");
    }

    #[test]
    fn non_curve_mechanism_is_rejected() {
        let store = CertStore::new();
        let reply = respond(&store, &curve_request(&[7u8; 32], b"PLAIN"));
        assert_eq!(reply[2], "400");
    }

    #[test]
    fn short_request_is_rejected() {
        let store = CertStore::new();
        let reply = respond(&store, &[b"1.0".to_vec(), b"9".to_vec()]);
        assert_eq!(reply[2], "400");
        assert_eq!(reply[1], "9");
    }

    #[test]
    fn second_agent_on_one_context_fails() {
        let tc = TransportContext::new();
        let reactor = Reactor::new().unwrap();
        let store = Rc::new(RefCell::new(CertStore::new()));

        let first = ZapAgent::new(&tc, &reactor, store.clone()).unwrap();
        let err = ZapAgent::new(&tc, &reactor, store).unwrap_err();
        assert_eq!(err.errnum(), canopy_core::error::errnum::EEXIST);
        first.shutdown();
    }
}
