// Settings resolved from the environment (after `.env` is loaded in main).

use std::env;

lazy_static::lazy_static! {
    pub static ref OPENAI_BASE_URL: String = env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    pub static ref FITCOACH_MODEL: String = env::var("FITCOACH_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".to_string());
    pub static ref TEMPLATES_DIR: String = env::var("FITCOACH_TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_string());
    pub static ref STATIC_DIR: String = env::var("FITCOACH_STATIC_DIR").unwrap_or_else(|_| "static".to_string());
    // Blank counts as missing.
    pub static ref OPENAI_API_KEY: Option<String> = env::var("OPENAI_API_KEY")
        .ok()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty());
}

pub const MISSING_KEY_NOTICE: &str = "Please add your OpenAI API key to continue.";

pub const DEFAULT_PORT: u16 = 8501;
