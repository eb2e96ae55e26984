// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BonsaiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Tree '{name}' operation failed{}: {source}", key_context(.key))]
    Tree {
        name: String,
        key: Option<String>,
        #[source]
        source: Box<BonsaiError>,
    },

    #[error("Nested atomic operation rolled back, outer caller must abort")]
    Rollback,

    #[error("Storage corruption: {0}")]
    Corruption(String),

    #[error("WAL corruption detected")]
    WalCorruption,

    #[error("File '{0}' not found in cache")]
    FileNotFound(String),

    #[error("Tree '{0}' is closed")]
    TreeClosed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

fn key_context(key: &Option<String>) -> String {
    match key {
        Some(k) => format!(" for key {}", k),
        None => String::new(),
    }
}

impl BonsaiError {
    /// Wrap a lower-level failure with tree context at the public boundary.
    pub fn in_tree(self, name: &str, key: Option<String>) -> Self {
        BonsaiError::Tree {
            name: name.to_string(),
            key,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BonsaiError>;
