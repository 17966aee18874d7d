use crate::error::{Error, Result};
use crate::template::TemplateSnapshot;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::collections::HashMap;
use tracing::warn;

const TEMPLATES_KEY: &str = "bucketlock:templates";

/// Central copy of the family templates, so a restarted service starts from
/// the tightest values any earlier run observed.
pub struct TemplateStore {
    client: Client,
    key: String,
}

impl TemplateStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Redis(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            key: TEMPLATES_KEY.to_string(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| Error::Redis(format!("Failed to connect to Redis: {}", e)))
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| Error::Redis(format!("Ping failed: {}", e)))
    }

    pub async fn load_all(&self) -> Result<HashMap<String, TemplateSnapshot>> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&self.key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("HGETALL failed: {}", e)))?;

        let mut templates = HashMap::with_capacity(raw.len());
        for (shape, value) in raw {
            match decode(&value) {
                Some(snapshot) => {
                    templates.insert(shape, snapshot);
                }
                None => warn!(shape = %shape, value = %value, "Skipping malformed stored template"),
            }
        }
        Ok(templates)
    }

    pub async fn save(&self, shape: &str, snapshot: TemplateSnapshot) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("HSET")
            .arg(&self.key)
            .arg(shape)
            .arg(encode(snapshot))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("HSET failed: {}", e)))
    }
}

fn encode(snapshot: TemplateSnapshot) -> String {
    format!("{}:{}", snapshot.limit, snapshot.reset_after_ms)
}

fn decode(value: &str) -> Option<TemplateSnapshot> {
    let (limit, reset_after_ms) = value.split_once(':')?;
    Some(TemplateSnapshot {
        limit: limit.parse().ok()?,
        reset_after_ms: reset_after_ms.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_template_format() {
        let snapshot = TemplateSnapshot {
            limit: 5,
            reset_after_ms: 2500,
        };
        assert_eq!(encode(snapshot), "5:2500");
        assert_eq!(decode("5:2500"), Some(snapshot));
        assert_eq!(decode("5"), None);
        assert_eq!(decode("a:1"), None);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            TemplateStore::new("not a url"),
            Err(Error::Redis(_))
        ));
    }
}
