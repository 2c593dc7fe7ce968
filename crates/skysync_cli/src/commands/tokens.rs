//! Tokens command implementation.

use serde::Serialize;
use skysync_engine::ChangeTokenStore;
use std::path::Path;

/// One stored cursor.
#[derive(Debug, Serialize)]
pub struct TokenInfo {
    /// Partition the cursor belongs to.
    pub partition: String,
    /// Database scope.
    pub scope: String,
    /// Zone name, for zone partitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Token bytes, hex-encoded.
    pub token: String,
    /// Token size in bytes.
    pub size: usize,
}

/// Runs the tokens command.
pub fn run(file: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !file.exists() {
        return Err(format!("No token blob found at {:?}", file).into());
    }

    let blob = std::fs::read(file)?;
    let tokens = describe(&blob)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&tokens)?);
        }
        _ => {
            print_text_output(file, &tokens);
        }
    }

    Ok(())
}

/// Decodes a token blob into printable entries.
pub fn describe(blob: &[u8]) -> Result<Vec<TokenInfo>, Box<dyn std::error::Error>> {
    let store = ChangeTokenStore::decode(blob)?;
    Ok(store
        .entries()
        .into_iter()
        .map(|(partition, token)| TokenInfo {
            partition: partition.to_string(),
            scope: partition.scope().to_string(),
            zone: partition.zone().map(ToString::to_string),
            token: hex(token.as_bytes()),
            size: token.as_bytes().len(),
        })
        .collect())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn print_text_output(file: &Path, tokens: &[TokenInfo]) {
    println!("Change Tokens ({} total)", tokens.len());
    println!("==================");
    println!("File: {}", file.display());
    println!();

    for info in tokens {
        println!("{:40} {} ({} bytes)", info.partition, info.token, info.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skysync_cloud::{ChangeToken, DatabaseScope, Partition, ZoneId};

    #[test]
    fn describes_each_partition() {
        let store = ChangeTokenStore::new();
        store.set(
            Partition::Database(DatabaseScope::Private),
            Some(ChangeToken::from_bytes(vec![0x01, 0xab])),
        );
        store.set(
            Partition::Zone(DatabaseScope::Private, ZoneId::owned("Main")),
            Some(ChangeToken::from_bytes(vec![0xff])),
        );
        let blob = store.encode().unwrap();

        let tokens = describe(&blob).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].token, "01ab");
        assert!(tokens[0].zone.is_none());
        assert_eq!(tokens[1].size, 1);
        assert!(tokens[1].zone.is_some());
    }

    #[test]
    fn rejects_garbage() {
        assert!(describe(b"not cbor at all").is_err());
    }
}
