use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    /// Schema whose structure is cloned into every new tenant schema.
    pub template_schema: String,
    /// Upper bound on how many pending tenants a single claim may lock.
    pub tenant_batch_size: i64,
    pub super_admin_key: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            template_schema: env::var("TEMPLATE_SCHEMA")
                .unwrap_or_else(|_| "template0".into()),
            tenant_batch_size: env::var("TENANT_BATCH_SIZE")
                .unwrap_or_else(|_| "25".into())
                .parse()?,
            super_admin_key: env::var("SUPER_ADMIN_KEY")
                .unwrap_or_else(|_| "change_this_super_admin_key".into()),
        })
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}
