use object_pool::Pool;

use crate::Message;

/// Number of idle messages the pool retains.
const POOL_SHELF: usize = 256;

/// Global message pool. Disabled pools degrade to plain allocation so the
/// acquire/release contract is identical either way: a released message must
/// never be touched again.
pub struct MessagePool {
    inner: Option<Pool<Message>>,
    capacity: usize,
}

impl MessagePool {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        MessagePool {
            inner: enabled.then(|| Pool::new(POOL_SHELF, Message::new)),
            capacity,
        }
    }

    /// Take a message, reusing a pooled one when available.
    pub fn acquire(&self) -> Message {
        match &self.inner {
            Some(pool) => match pool.try_pull() {
                Some(reusable) => reusable.detach().1,
                None => Message::new(),
            },
            None => Message::new(),
        }
    }

    /// Clear a message and shelve it for reuse.
    pub fn release(&self, mut message: Message) {
        if let Some(pool) = &self.inner {
            message.clear(self.capacity);
            drop(pool.attach(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Flags, Limits, Protocol, MAGIC_PATH_JSON};

    #[test]
    fn release_clears_fields_and_keeps_bounded_capacity() {
        let protocol = Protocol::new(Limits::default(), false);
        let pool = MessagePool::new(true, 64);

        let mut msg = pool.acquire();
        msg.marshal_bytes(
            MAGIC_PATH_JSON,
            Flags::NEED_ACK,
            5,
            "/echo",
            &[7u8; 2048],
            &protocol,
        )
        .unwrap();
        pool.release(msg);

        let msg = pool.acquire();
        assert_eq!(msg.magic(), 0);
        assert_eq!(msg.flags(), Flags::empty());
        assert_eq!(msg.size(), 0);
        assert_eq!(msg.index(), 0);
        assert!(msg.body_capacity() <= 64);
    }

    #[test]
    fn disabled_pool_always_allocates() {
        let pool = MessagePool::new(false, 64);
        let msg = pool.acquire();
        assert_eq!(msg.size(), 0);
        pool.release(msg);
    }
}
