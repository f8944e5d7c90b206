use redis::RedisResult;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Fixed-window counter; true while `key` stays within `limit` hits per
    /// `window_seconds`.
    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let bucket = window_bucket(key, chrono::Utc::now().timestamp(), window_seconds);

        // each window gets its own key, so refreshing the expiry never extends it
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(&bucket, 1)
            .expire(&bucket, window_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }
}

/// Counter key for the window containing `now` (unix seconds).
fn window_bucket(key: &str, now: i64, window_seconds: i64) -> String {
    format!("{}:{}", key, now.div_euclid(window_seconds.max(1)))
}

pub fn rate_limit_key(scope: &str, client: &str) -> String {
    format!("rate_limit:{}:{}", scope, client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_accepts_valid_url_without_connecting() {
        assert!(RedisClient::new("redis://127.0.0.1:6379").await.is_ok());
        assert!(RedisClient::new("not a url").await.is_err());
    }

    #[test]
    fn test_rate_limit_key() {
        assert_eq!(rate_limit_key("bookings", "10.0.0.1"), "rate_limit:bookings:10.0.0.1");
    }

    #[test]
    fn test_window_bucket_rolls_over() {
        let key = rate_limit_key("api", "10.0.0.1");
        let start = 1_700_000_040;
        assert_eq!(window_bucket(&key, start, 60), window_bucket(&key, start + 59, 60));
        assert_ne!(window_bucket(&key, start, 60), window_bucket(&key, start + 60, 60));

        // steady polling every 10s lands in a fresh bucket at least once a minute
        let buckets: std::collections::HashSet<String> =
            (0..120).map(|i| window_bucket(&key, start + i * 10, 60)).collect();
        assert_eq!(buckets.len(), 20);
    }
}
