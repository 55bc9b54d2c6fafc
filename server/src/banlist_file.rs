use crate::ban::BanEntry;
use std::io;
use std::path::Path;
use tokio::fs;

pub async fn write_banlist_file(path: &Path, entries: &[BanEntry]) -> io::Result<()> {
    let content = serde_json::to_vec_pretty(entries)?;
    fs::write(path, content).await
}

/// Reads a ban list file. A missing file is an empty ban list.
pub async fn read_banlist_file(path: &Path) -> io::Result<Vec<BanEntry>> {
    match fs::read(path).await {
        Ok(content) => Ok(serde_json::from_slice(&content)?),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::EXPIRATION_FORMAT;
    use chrono::NaiveDateTime;

    #[tokio::test]
    async fn it_reads_what_it_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bans.json");
        let entries = vec![BanEntry {
            id: 3,
            ip: "10.1.2.3".parse().unwrap(),
            subnet: 16,
            expiration: NaiveDateTime::parse_from_str("2031-02-03 04:05:06", EXPIRATION_FORMAT)
                .unwrap(),
            comment: "flood".into(),
        }];

        write_banlist_file(&path, &entries).await.unwrap();
        assert_eq!(read_banlist_file(&path).await.unwrap(), entries);
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let entries = read_banlist_file(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }
}
