//! ZFS and NFS operations on storage appliances, composed over [`SshRunner`].
//!
//! Commands are built here; transport, auditing, and credential handling
//! stay with the caller. Dataset and pool names come from coordinator
//! records and operator input, so every name is validated before it is
//! interpolated into a command line.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use super::ssh::{CommandOutput, SshRunner, SshTarget};

const SHORT_TIMEOUT: Duration = Duration::from_secs(30);
const LONG_TIMEOUT: Duration = Duration::from_secs(600);

/// Reject names that could escape into the shell.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("empty ZFS name");
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@'));
    if !ok {
        bail!("invalid character in ZFS name: {name:?}");
    }
    Ok(())
}

/// ZFS operations bound to one appliance.
pub struct ZfsOps<'a> {
    runner: &'a dyn SshRunner,
    target: &'a SshTarget,
}

impl<'a> ZfsOps<'a> {
    pub fn new(runner: &'a dyn SshRunner, target: &'a SshTarget) -> Self {
        Self { runner, target }
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.runner.exec(self.target, command, timeout).await
    }

    async fn run_checked(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let output = self.run(command, timeout).await?;
        if !output.success() {
            bail!(
                "remote command failed ({}): {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }

    /// Find an unpartitioned, unmounted data disk suitable for a new pool.
    pub async fn detect_data_disk(&self) -> Result<Option<String>> {
        let output = self
            .run_checked(
                "lsblk -dnpo NAME,TYPE,MOUNTPOINT | awk '$2==\"disk\" && $3==\"\" {print $1}'",
                SHORT_TIMEOUT,
            )
            .await?;
        let mut candidates: Vec<&str> = output.stdout.lines().map(str::trim).collect();
        candidates.retain(|line| !line.is_empty());

        // Exclude disks already backing a pool.
        let pools = self.run("zpool status 2>/dev/null", SHORT_TIMEOUT).await?;
        candidates.retain(|disk| {
            let short = disk.trim_start_matches("/dev/");
            !pools.stdout.contains(short)
        });
        Ok(candidates.last().map(|s| s.to_string()))
    }

    pub async fn create_pool(&self, pool: &str, disk: &str) -> Result<()> {
        validate_name(pool)?;
        validate_name(disk)?;
        self.run_checked(&format!("zpool create -f {pool} {disk}"), LONG_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn pool_health(&self, pool: &str) -> Result<String> {
        validate_name(pool)?;
        let output = self
            .run_checked(&format!("zpool list -H -o health {pool}"), SHORT_TIMEOUT)
            .await?;
        Ok(output.stdout_trimmed().to_string())
    }

    /// `(size_bytes, free_bytes)` for a pool.
    pub async fn pool_space(&self, pool: &str) -> Result<(u64, u64)> {
        validate_name(pool)?;
        let output = self
            .run_checked(&format!("zpool list -Hp -o size,free {pool}"), SHORT_TIMEOUT)
            .await?;
        let mut fields = output.stdout_trimmed().split_whitespace();
        let size = fields
            .next()
            .and_then(|v| v.parse().ok())
            .context("could not parse pool size")?;
        let free = fields
            .next()
            .and_then(|v| v.parse().ok())
            .context("could not parse pool free space")?;
        Ok((size, free))
    }

    pub async fn create_dataset(&self, dataset: &str) -> Result<()> {
        validate_name(dataset)?;
        self.run_checked(&format!("zfs create -p {dataset}"), SHORT_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn mountpoint(&self, dataset: &str) -> Result<String> {
        validate_name(dataset)?;
        let output = self
            .run_checked(
                &format!("zfs get -H -o value mountpoint {dataset}"),
                SHORT_TIMEOUT,
            )
            .await?;
        Ok(output.stdout_trimmed().to_string())
    }

    /// Export a dataset over NFS to the given client network.
    pub async fn set_sharenfs(&self, dataset: &str, network: &str) -> Result<()> {
        validate_name(dataset)?;
        if !network
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | ':'))
        {
            bail!("invalid NFS client network: {network:?}");
        }
        self.run_checked(
            &format!("zfs set sharenfs='rw=@{network},no_root_squash' {dataset}"),
            SHORT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn snapshot(&self, dataset: &str, name: &str) -> Result<String> {
        validate_name(dataset)?;
        validate_name(name)?;
        let full = format!("{dataset}@{name}");
        self.run_checked(&format!("zfs snapshot {full}"), SHORT_TIMEOUT)
            .await?;
        Ok(full)
    }

    /// Snapshots of a dataset, oldest first.
    pub async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        validate_name(dataset)?;
        let output = self
            .run_checked(
                &format!("zfs list -H -t snapshot -o name -s creation -d 1 {dataset}"),
                SHORT_TIMEOUT,
            )
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Estimated size in bytes of a send (full or incremental).
    pub async fn estimate_send(
        &self,
        dataset: &str,
        from_snapshot: Option<&str>,
        to_snapshot: &str,
    ) -> Result<u64> {
        validate_name(dataset)?;
        validate_name(to_snapshot)?;
        let incremental = match from_snapshot {
            Some(prev) => {
                validate_name(prev)?;
                format!("-i {dataset}@{prev} ")
            }
            None => String::new(),
        };
        let output = self
            .run_checked(
                &format!("zfs send -nP {incremental}{dataset}@{to_snapshot}"),
                SHORT_TIMEOUT,
            )
            .await?;
        Ok(parse_send_size(&output.stdout).or_else(|| parse_send_size(&output.stderr)).unwrap_or(0))
    }

    /// Run the send/receive pipeline from this appliance to the destination.
    /// Key trust between the pair is established by the key-exchange job.
    pub async fn send_incremental(
        &self,
        dataset: &str,
        from_snapshot: Option<&str>,
        to_snapshot: &str,
        dest: &SshTarget,
        dest_dataset: &str,
    ) -> Result<u64> {
        validate_name(dataset)?;
        validate_name(to_snapshot)?;
        validate_name(dest_dataset)?;

        let estimated = self.estimate_send(dataset, from_snapshot, to_snapshot).await?;

        let incremental = match from_snapshot {
            Some(prev) => format!("-i {dataset}@{prev} "),
            None => String::new(),
        };
        let pipeline = format!(
            "zfs send {incremental}{dataset}@{to_snapshot} | \
             ssh -o StrictHostKeyChecking=no -p {} {}@{} zfs receive -F {dest_dataset}",
            dest.port, dest.username, dest.host,
        );
        self.run_checked(&pipeline, LONG_TIMEOUT).await?;
        Ok(estimated)
    }

    pub async fn clone_snapshot(&self, snapshot: &str, clone: &str) -> Result<()> {
        validate_name(snapshot)?;
        validate_name(clone)?;
        self.run_checked(&format!("zfs clone {snapshot} {clone}"), SHORT_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn promote(&self, dataset: &str) -> Result<()> {
        validate_name(dataset)?;
        self.run_checked(&format!("zfs promote {dataset}"), SHORT_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn destroy_dataset(&self, dataset: &str) -> Result<()> {
        validate_name(dataset)?;
        self.run_checked(&format!("zfs destroy -r {dataset}"), LONG_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn hostname(&self) -> Result<String> {
        let output = self.run_checked("hostname", SHORT_TIMEOUT).await?;
        Ok(output.stdout_trimmed().to_string())
    }
}

/// Parse the `size <bytes>` line of `zfs send -nP` output.
fn parse_send_size(output: &str) -> Option<u64> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("size"), Some(bytes)) => bytes.parse().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("tank/vm-01").is_ok());
        assert!(validate_name("tank@snap-2024.01.01").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("tank; rm -rf /").is_err());
        assert!(validate_name("tank$(reboot)").is_err());
    }

    #[test]
    fn test_parse_send_size() {
        let out = "incremental\ttank/vm@a\ttank/vm@b\nsize\t123456\n";
        assert_eq!(parse_send_size(out), Some(123456));
        assert_eq!(parse_send_size("no size here"), None);
    }
}
