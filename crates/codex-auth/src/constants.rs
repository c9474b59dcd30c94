//! OpenAI OAuth constants
//!
//! Public OAuth client configuration matching the Codex CLI. These values
//! are not secrets; they identify the public client application. The actual
//! secrets (access/refresh tokens) live in the account pool file.

/// Public OAuth client ID (same as Codex CLI)
pub const CODEX_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Token endpoint for token refresh
pub const TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";

/// Scopes requested on refresh
pub const REFRESH_SCOPES: &str = "openid profile email";

/// JWT claim namespace holding ChatGPT account metadata
pub const AUTH_CLAIM_NAMESPACE: &str = "https://api.openai.com/auth";

/// Default upstream base URL for the ChatGPT backend
pub const DEFAULT_UPSTREAM_URL: &str = "https://chatgpt.com/backend-api";

/// Provider key used by foreign credential files for this upstream
pub const DEFAULT_PROVIDER_KEY: &str = "openai";

/// Header carrying the ChatGPT account id on backend requests
pub const ACCOUNT_ID_HEADER: &str = "chatgpt-account-id";

/// `OpenAI-Beta` value required by the Codex responses endpoint
pub const RESPONSES_BETA: &str = "responses=experimental";

/// `originator` header value identifying the client
pub const ORIGINATOR: &str = "codex_cli_rs";

/// Backend usage endpoint, relative to the upstream base URL
pub const USAGE_PATH: &str = "/wham/usage";
