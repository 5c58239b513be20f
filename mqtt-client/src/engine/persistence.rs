use bytes::{Buf, BufMut, Bytes, BytesMut};
use mqtt_core::qos::QosLevel;

use crate::{
    error::{ClientError, ClientErrorKind},
    store::Store,
};

const RECORD_SUBSCRIBE: u8 = 1;
const RECORD_UNSUBSCRIBE: u8 = 2;
const RECORD_PUBLISH: u8 = 3;

/// On-disk shape of a command durable enough to survive a crash: PUBLISH,
/// SUBSCRIBE, and UNSUBSCRIBE are the only commands the engine persists
/// (§4.2) — CONNECT/DISCONNECT are re-issued by the host application.
pub enum CommandRecord {
    Subscribe { token: u16, topics: Vec<(String, QosLevel)> },
    Unsubscribe { token: u16, topics: Vec<String> },
    Publish {
        token: u16,
        topic: String,
        payload: Bytes,
        qos: QosLevel,
        retained: bool,
    },
}

fn put_nul_terminated(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

fn take_nul_terminated(bytes: &mut Bytes) -> Result<String, ClientError> {
    let end = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| malformed("record is missing a NUL-terminated string"))?;
    let raw = bytes.split_to(end);
    bytes.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| malformed("record contains invalid UTF-8"))
}

fn malformed(message: &str) -> ClientError {
    ClientError::new(ClientErrorKind::PersistenceError, message.to_string())
}

impl CommandRecord {
    pub fn token(&self) -> u16 {
        match self {
            Self::Subscribe { token, .. } => *token,
            Self::Unsubscribe { token, .. } => *token,
            Self::Publish { token, .. } => *token,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Subscribe { token, topics } => {
                buf.put_u8(RECORD_SUBSCRIBE);
                buf.put_u16(*token);
                buf.put_u16(topics.len() as u16);
                for (topic, qos) in topics {
                    put_nul_terminated(&mut buf, topic);
                    buf.put_u8(*qos as u8);
                }
            }
            Self::Unsubscribe { token, topics } => {
                buf.put_u8(RECORD_UNSUBSCRIBE);
                buf.put_u16(*token);
                buf.put_u16(topics.len() as u16);
                for topic in topics {
                    put_nul_terminated(&mut buf, topic);
                }
            }
            Self::Publish {
                token,
                topic,
                payload,
                qos,
                retained,
            } => {
                buf.put_u8(RECORD_PUBLISH);
                buf.put_u16(*token);
                put_nul_terminated(&mut buf, topic);
                buf.put_u32(payload.len() as u32);
                buf.extend_from_slice(payload);
                buf.put_u8(*qos as u8);
                buf.put_u8(*retained as u8);
            }
        }
        buf.freeze()
    }

    /// Each variant reads its *own* `count` field. The source this engine is
    /// modelled on reuses SUBSCRIBE's count field when restoring UNSUBSCRIBE
    /// records — almost certainly a bug, fixed here (§9 design note).
    pub fn decode(mut bytes: Bytes) -> Result<Self, ClientError> {
        if bytes.is_empty() {
            return Err(malformed("empty persistence record"));
        }
        let type_tag = bytes[0];
        bytes.advance(1);

        if bytes.len() < 2 {
            return Err(malformed("record is missing its token field"));
        }
        let token = bytes.get_u16();

        match type_tag {
            RECORD_SUBSCRIBE => {
                if bytes.len() < 2 {
                    return Err(malformed("SUBSCRIBE record is missing its count field"));
                }
                let count = bytes.get_u16();
                let mut topics = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let topic = take_nul_terminated(&mut bytes)?;
                    if bytes.is_empty() {
                        return Err(malformed("SUBSCRIBE record is missing a qos byte"));
                    }
                    let qos = QosLevel::try_from(bytes[0])?;
                    bytes.advance(1);
                    topics.push((topic, qos));
                }
                Ok(Self::Subscribe { token, topics })
            }
            RECORD_UNSUBSCRIBE => {
                if bytes.len() < 2 {
                    return Err(malformed("UNSUBSCRIBE record is missing its count field"));
                }
                let count = bytes.get_u16();
                let mut topics = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    topics.push(take_nul_terminated(&mut bytes)?);
                }
                Ok(Self::Unsubscribe { token, topics })
            }
            RECORD_PUBLISH => {
                let topic = take_nul_terminated(&mut bytes)?;
                if bytes.len() < 4 {
                    return Err(malformed("PUBLISH record is missing its payload length"));
                }
                let payload_len = bytes.get_u32() as usize;
                if bytes.len() < payload_len + 2 {
                    return Err(malformed("PUBLISH record payload is truncated"));
                }
                let payload = bytes.split_to(payload_len);
                let qos = QosLevel::try_from(bytes[0])?;
                let retained = bytes[1] != 0;
                Ok(Self::Publish {
                    token,
                    topic,
                    payload,
                    qos,
                    retained,
                })
            }
            other => Err(malformed(&format!("unrecognised persistence record tag {other}"))),
        }
    }
}

/// Serialises pending commands and in-flight QoS 1/2 publications, and restores
/// them in ascending sequence-number order on client creation.
pub struct PersistentReplay;

impl PersistentReplay {
    fn key(client_id: &str, seqno: u64) -> String {
        format!("c-{client_id}-{seqno}")
    }

    pub fn persist(store: &dyn Store, client_id: &str, seqno: u64, record: &CommandRecord) -> Result<(), ClientError> {
        store.put(&Self::key(client_id, seqno), record.encode().to_vec())
    }

    pub fn unpersist(store: &dyn Store, client_id: &str, seqno: u64) -> Result<(), ClientError> {
        store.remove(&Self::key(client_id, seqno))
    }

    /// Enumerates this client's persisted commands, decodes each, and returns
    /// them sorted by ascending seqno — the order the queue must re-admit them
    /// in so wire emission order matches the original submission order.
    pub fn restore(store: &dyn Store, client_id: &str) -> Result<Vec<(u64, CommandRecord)>, ClientError> {
        let prefix = format!("c-{client_id}-");
        let mut restored = Vec::new();

        for key in store.list(&prefix)? {
            let seqno: u64 = key[prefix.len()..].parse().map_err(|_| {
                malformed(&format!("persistence key `{key}` has a non-numeric sequence tail"))
            })?;
            let Some(bytes) = store.get(&key)? else {
                continue;
            };
            match CommandRecord::decode(Bytes::from(bytes)) {
                Ok(record) => restored.push((seqno, record)),
                Err(err) => {
                    log::error!("dropping unreadable persisted command {key}: {err}");
                }
            }
        }

        restored.sort_by_key(|(seqno, _)| *seqno);
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn subscribe_and_unsubscribe_restore_independently() {
        let sub = CommandRecord::Subscribe {
            token: 7,
            topics: vec![("a/b".to_string(), QosLevel::AtLeastOnce)],
        };
        let unsub = CommandRecord::Unsubscribe {
            token: 8,
            topics: vec!["a/b".to_string(), "c/d".to_string()],
        };

        let decoded_sub = CommandRecord::decode(sub.encode()).unwrap();
        let decoded_unsub = CommandRecord::decode(unsub.encode()).unwrap();

        match decoded_sub {
            CommandRecord::Subscribe { topics, .. } => assert_eq!(topics.len(), 1),
            _ => panic!("expected Subscribe"),
        }
        match decoded_unsub {
            CommandRecord::Unsubscribe { topics, .. } => assert_eq!(topics.len(), 2),
            _ => panic!("expected Unsubscribe"),
        }
    }

    #[test]
    fn publish_round_trips() {
        let record = CommandRecord::Publish {
            token: 3,
            topic: "t".to_string(),
            payload: Bytes::from_static(b"hello"),
            qos: QosLevel::ExactlyOnce,
            retained: true,
        };
        let decoded = CommandRecord::decode(record.encode()).unwrap();
        match decoded {
            CommandRecord::Publish { topic, payload, qos, retained, .. } => {
                assert_eq!(topic, "t");
                assert_eq!(payload, Bytes::from_static(b"hello"));
                assert_eq!(qos, QosLevel::ExactlyOnce);
                assert!(retained);
            }
            _ => panic!("expected Publish"),
        }
    }

    #[test]
    fn restore_orders_by_ascending_seqno() {
        let store = MemStore::new();
        let later = CommandRecord::Publish {
            token: 2,
            topic: "t".to_string(),
            payload: Bytes::new(),
            qos: QosLevel::AtLeastOnce,
            retained: false,
        };
        let earlier = CommandRecord::Publish {
            token: 1,
            topic: "t".to_string(),
            payload: Bytes::new(),
            qos: QosLevel::AtLeastOnce,
            retained: false,
        };
        PersistentReplay::persist(&store, "client-a", 5, &later).unwrap();
        PersistentReplay::persist(&store, "client-a", 2, &earlier).unwrap();

        let restored = PersistentReplay::restore(&store, "client-a").unwrap();
        assert_eq!(restored.iter().map(|(seqno, _)| *seqno).collect::<Vec<_>>(), vec![2, 5]);
    }
}
