//! Service configuration

/// Refund server configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP port
    pub port: u16,
    /// Allowed CORS origin for the admin UI (absent = no CORS layer)
    pub admin_cors_origin: Option<String>,

    /// Business database (users, top-ups, admin table), MySQL
    pub business_db_host: String,
    pub business_db_port: u16,
    pub business_db_user: String,
    pub business_db_password: String,
    pub business_db_name: String,

    /// Refund audit store PostgreSQL connection URL
    pub audit_database_url: String,

    /// HS256 secret for admin JWT bearer tokens
    pub jwt_secret: String,
    /// Admin email allowlist (comma-separated in env)
    pub admin_emails: Vec<String>,
    /// Optional shared-secret bearer token
    pub admin_api_key: Option<String>,

    /// Aggregator (Alipay/WeChat) refund gateway
    pub aggregator_base_url: Option<String>,
    pub aggregator_pid: Option<String>,
    /// PEM, base64-of-PEM, or base64 DER (PKCS#8 or PKCS#1)
    pub aggregator_private_key: Option<String>,
    /// Optional response-verification key (SPKI or PKCS#1)
    pub aggregator_public_key: Option<String>,
    /// RSA2 (SHA-256, default) or RSA (SHA-1)
    pub aggregator_sign_type: String,

    /// Card processor secret key
    pub stripe_secret_key: Option<String>,
    /// Card processor API base (overridable for tests)
    pub stripe_api_base: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            admin_cors_origin: std::env::var("ADMIN_CORS_ORIGIN").ok(),

            business_db_host: std::env::var("DB_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            business_db_port: std::env::var("DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3306),
            business_db_user: std::env::var("DB_USER").expect("DB_USER must be set"),
            business_db_password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            business_db_name: std::env::var("DB_NAME").expect("DB_NAME must be set"),

            audit_database_url: std::env::var("AUDIT_DATABASE_URL")
                .expect("AUDIT_DATABASE_URL must be set"),

            jwt_secret: std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
            admin_emails: std::env::var("ADMIN_EMAILS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok().filter(|s| !s.is_empty()),

            aggregator_base_url: std::env::var("AGGREGATOR_BASE_URL").ok(),
            aggregator_pid: std::env::var("AGGREGATOR_PID").ok(),
            aggregator_private_key: std::env::var("AGGREGATOR_PRIVATE_KEY").ok(),
            aggregator_public_key: std::env::var("AGGREGATOR_PUBLIC_KEY").ok(),
            aggregator_sign_type: std::env::var("AGGREGATOR_SIGN_TYPE")
                .unwrap_or_else(|_| "RSA2".into()),

            stripe_secret_key: std::env::var("STRIPE_SECRET_KEY").ok().filter(|s| !s.is_empty()),
            stripe_api_base: std::env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com/v1".into()),
        }
    }

    /// MySQL connection URL for the business database
    pub fn business_database_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.business_db_user,
            self.business_db_password,
            self.business_db_host,
            self.business_db_port,
            self.business_db_name
        )
    }
}
