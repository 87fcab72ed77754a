//! Redis-backed delivery channels.
//!
//! - [`RedisDispatchQueue`]: one stream + consumer group; the pending entry
//!   list is the lease table, and the delivery counter decides dead-lettering
//! - [`RedisFanoutStream`]: one stream per partition with a stored checkpoint
//!
//! Both are synchronous and open a connection per operation, like the rest of
//! the Redis code in this crate.

#[cfg(feature = "redis")]
pub mod redis_queue;
#[cfg(feature = "redis")]
pub mod redis_stream;

#[cfg(feature = "redis")]
pub use redis_queue::RedisDispatchQueue;
#[cfg(feature = "redis")]
pub use redis_stream::RedisFanoutStream;

#[cfg(feature = "redis")]
mod entry {
    use std::collections::HashMap;

    use cubeflow_channels::ChannelError;

    /// One stream entry: id plus its field map.
    #[derive(Debug, Clone)]
    pub(crate) struct Entry {
        pub id: String,
        pub fields: HashMap<String, String>,
    }

    impl Entry {
        pub fn field(&self, name: &str) -> Result<&str, ChannelError> {
            self.fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| ChannelError::Serialization(format!("entry {} has no '{name}' field", self.id)))
        }
    }

    pub(crate) fn connect(client: &redis::Client) -> Result<redis::Connection, ChannelError> {
        client
            .get_connection()
            .map_err(|e| ChannelError::Transport(format!("redis connection: {e}")))
    }

    pub(crate) fn command_error(command: &str, err: redis::RedisError) -> ChannelError {
        ChannelError::Transport(format!("{command} failed: {err}"))
    }

    fn text(value: &redis::Value) -> Option<String> {
        match value {
            redis::Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
            redis::Value::Status(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Parse `[id, [k1, v1, k2, v2, ...]]`.
    pub(crate) fn parse_entry(value: &redis::Value) -> Result<Entry, ChannelError> {
        let redis::Value::Bulk(parts) = value else {
            return Err(ChannelError::Serialization("invalid stream entry".to_string()));
        };
        let (Some(id), Some(redis::Value::Bulk(raw_fields))) = (parts.first().and_then(text), parts.get(1)) else {
            return Err(ChannelError::Serialization("invalid stream entry layout".to_string()));
        };

        let mut fields = HashMap::new();
        for pair in raw_fields.chunks(2) {
            if let [k, v] = pair {
                if let (Some(k), Some(v)) = (text(k), text(v)) {
                    fields.insert(k, v);
                }
            }
        }
        Ok(Entry { id, fields })
    }

    /// Parse an `XRANGE`/`XCLAIM` reply. Deleted entries (nil) are dropped.
    pub(crate) fn parse_entries(value: &redis::Value) -> Result<Vec<Entry>, ChannelError> {
        match value {
            redis::Value::Nil => Ok(Vec::new()),
            redis::Value::Bulk(items) => items
                .iter()
                .filter(|v| !matches!(v, redis::Value::Nil))
                .map(parse_entry)
                .collect(),
            _ => Err(ChannelError::Serialization("invalid stream range reply".to_string())),
        }
    }

    /// Parse an `XREADGROUP` reply for a single stream.
    pub(crate) fn parse_read_reply(value: &redis::Value) -> Result<Vec<Entry>, ChannelError> {
        match value {
            redis::Value::Nil => Ok(Vec::new()),
            redis::Value::Bulk(streams) => {
                let mut entries = Vec::new();
                for stream in streams {
                    if let redis::Value::Bulk(parts) = stream {
                        if let Some(list) = parts.get(1) {
                            entries.extend(parse_entries(list)?);
                        }
                    }
                }
                Ok(entries)
            }
            _ => Err(ChannelError::Serialization("invalid XREADGROUP reply".to_string())),
        }
    }

}
