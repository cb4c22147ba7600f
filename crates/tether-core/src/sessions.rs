use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::status::State;
use crate::Socket;

/// One authenticated identity and the socket currently carrying it.
pub struct Session {
    uuid: String,
    socket: RwLock<Weak<Socket>>,
    attach: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Session {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The socket currently bound to this identity, if still alive.
    pub fn socket(&self) -> Option<Arc<Socket>> {
        self.socket.read().upgrade()
    }

    /// Application login payload stored at verification.
    pub fn attach(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attach.read().clone()
    }
}

/// Identity registry driving the logged-in-elsewhere semantics.
///
/// `verify` binds a uuid to a socket after the application has checked
/// credentials. A second verify for the same uuid moves the identity to the
/// new socket: the old one gets `Replaced` (data cleared, delayed close),
/// the new one gets `Authentication` + `Reconnected`.
pub struct Sessions {
    map: RwLock<HashMap<String, Arc<Session>>>,
}

impl Sessions {
    pub(crate) fn new() -> Self {
        Sessions {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, uuid: &str) -> Option<Arc<Session>> {
        self.map.read().get(uuid).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Bind an authenticated identity to a socket.
    pub fn verify(
        &self,
        uuid: &str,
        socket: &Arc<Socket>,
        attach: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Arc<Session> {
        let (session, reconnect, replaced) = {
            let mut map = self.map.write();
            match map.get(uuid) {
                Some(existing) => {
                    let old = existing.socket.read().upgrade();
                    *existing.socket.write() = Arc::downgrade(socket);
                    *existing.attach.write() = attach;
                    (existing.clone(), true, old)
                }
                None => {
                    let session = Arc::new(Session {
                        uuid: uuid.to_string(),
                        socket: RwLock::new(Arc::downgrade(socket)),
                        attach: RwLock::new(attach),
                    });
                    map.insert(uuid.to_string(), session.clone());
                    (session, false, None)
                }
            }
        };
        if let Some(old) = replaced {
            if old.id() != socket.id() && old.state() == State::Connected {
                let ip = socket
                    .remote_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_default();
                old.replaced(&ip);
            }
        }
        socket.authentication(session.clone(), reconnect);
        session
    }

    /// Unbind on disconnect. No-op when the identity has already moved to
    /// another socket (its replaced predecessor carries no data).
    pub fn remove(&self, socket: &Socket) -> bool {
        let Some(data) = socket.data() else {
            return false;
        };
        let Ok(session) = data.downcast::<Session>() else {
            return false;
        };
        let owned = session
            .socket
            .read()
            .upgrade()
            .map(|current| current.id() == socket.id())
            .unwrap_or(true);
        if owned {
            self.map.write().remove(&session.uuid);
        }
        owned
    }
}
