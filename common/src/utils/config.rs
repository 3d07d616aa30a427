use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    OpenAi,
    Hashed,
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    OpenAi,
    Static,
    Disabled,
}

/// Chunking determinism knobs. Identical values must reproduce identical
/// chunk sequences bit-for-bit.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct ChunkSettings {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub min_tokens: usize,
    /// "whitespace" or a path to a HuggingFace tokenizer.json file.
    pub tokenizer_id: String,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            target_tokens: 450,
            overlap_tokens: 80,
            min_tokens: 100,
            tokenizer_id: "whitespace".to_string(),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct RetrievalSettings {
    pub k_retrieval: usize,
    pub k_fused: usize,
    pub k_rrf: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            k_retrieval: 20,
            k_fused: 10,
            k_rrf: 60,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct ContextSettings {
    pub budget_tokens: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            budget_tokens: 1800,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_seconds: u64,
    pub enable_persist: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            enable_persist: false,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct QuotaSettings {
    pub max_documents: u64,
    pub max_storage_bytes: u64,
    pub daily_queries: u64,
    pub daily_tokens: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            max_documents: 200,
            max_storage_bytes: 256 * 1024 * 1024,
            daily_queries: 2000,
            daily_tokens: 500_000,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct RateSettings {
    pub rpm: u64,
    pub tpm: u64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            rpm: 60,
            tpm: 90_000,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct IndexCacheSettings {
    pub size: usize,
    pub flush_interval_secs: u64,
}

impl Default for IndexCacheSettings {
    fn default() -> Self {
        Self {
            size: 10,
            flush_interval_secs: 30,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct ConfidenceSettings {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for ConfidenceSettings {
    fn default() -> Self {
        Self {
            high: 0.75,
            medium: 0.5,
            low: 0.25,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct RerankerSettings {
    pub enabled: bool,
    pub model_id: Option<String>,
    pub pool_size: Option<usize>,
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model_id: None,
            pool_size: None,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,
    pub model: String,
    pub dimensions: usize,
    pub max_batch_size: usize,
    pub max_batch_tokens: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::OpenAi,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            max_batch_size: 64,
            max_batch_tokens: 16_000,
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Canned answer used by the static backend in tests.
    pub static_answer: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            backend: LlmBackend::OpenAi,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_output_tokens: 700,
            static_answer: None,
            request_timeout_secs: 60,
        }
    }
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

fn default_greetings() -> Vec<String> {
    [
        "hi",
        "hello",
        "hey",
        "good morning",
        "good afternoon",
        "good evening",
        "thanks",
        "thank you",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_surreal_address")]
    pub surrealdb_address: String,
    #[serde(default = "default_surreal_cred")]
    pub surrealdb_username: String,
    #[serde(default = "default_surreal_cred")]
    pub surrealdb_password: String,
    #[serde(default = "default_surreal_ns")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_surreal_ns")]
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default)]
    pub chunk: ChunkSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub quota: QuotaSettings,
    #[serde(default)]
    pub rate: RateSettings,
    #[serde(default)]
    pub index_cache: IndexCacheSettings,
    #[serde(default)]
    pub confidence: ConfidenceSettings,
    #[serde(default)]
    pub reranker: RerankerSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default = "default_greetings")]
    pub greetings: Vec<String>,
}

fn default_surreal_address() -> String {
    "mem://".to_string()
}

fn default_surreal_cred() -> String {
    "root".to_string()
}

fn default_surreal_ns() -> String {
    "rag".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            surrealdb_address: default_surreal_address(),
            surrealdb_username: default_surreal_cred(),
            surrealdb_password: default_surreal_cred(),
            surrealdb_namespace: default_surreal_ns(),
            surrealdb_database: default_surreal_ns(),
            data_dir: default_data_dir(),
            storage: default_storage_kind(),
            chunk: ChunkSettings::default(),
            retrieval: RetrievalSettings::default(),
            context: ContextSettings::default(),
            cache: CacheSettings::default(),
            quota: QuotaSettings::default(),
            rate: RateSettings::default(),
            index_cache: IndexCacheSettings::default(),
            confidence: ConfidenceSettings::default(),
            reranker: RerankerSettings::default(),
            embedding: EmbeddingSettings::default(),
            llm: LlmSettings::default(),
            greetings: default_greetings(),
        }
    }
}

/// Loads configuration from an optional `config` file plus environment
/// variables. Nested sections use a double underscore, e.g.
/// `CHUNK__TARGET_TOKENS=450`.
pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}
