//! ramfs host: mounts an in-memory tree and runs a command script against it
//!
//! Commands come from the script file named on the command line, or from
//! stdin. The tree is torn down when the script ends.

mod script;

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ramfs_core::{mount, registry, MountOptions, FS_TYPE_NAME};
use script::ScriptRunner;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Command script to run; stdin when omitted
    script: Option<PathBuf>,

    /// Mount configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mount option string, e.g. "mode=0700", applied on top of the config
    #[arg(short, long)]
    options: Option<String>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(config_path: Option<PathBuf>, options: Option<&str>) -> Result<MountOptions> {
    let mut config = match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => MountOptions::default(),
    };
    if let Some(options) = options {
        config.apply(options)?;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config = load_config(args.config, args.options.as_deref())?;
    info!("Configuration loaded: {:?}", config);

    mount::init()?;
    let session = registry().mount_with(FS_TYPE_NAME, config)?;
    let tree = session.tree();

    let stdout = io::stdout();
    let mut runner = ScriptRunner::new(&tree, stdout.lock());
    let failures = match &args.script {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            runner.run(BufReader::new(file))?
        }
        None => runner.run(io::stdin().lock())?,
    };
    drop(runner);

    if failures > 0 {
        warn!("{} command(s) failed", failures);
    }
    session.unmount();
    mount::exit();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ramfs_core::FsError;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_loading_default() {
        let config = load_config(None, None).unwrap();
        assert_eq!(config, MountOptions::default());
        assert_eq!(config.mode, 0o755);
    }

    #[test]
    fn test_config_loading_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_json = r#"{
            "mode": 448,
            "uid": 1000,
            "memory": { "max_bytes_in_memory": 1048576 },
            "limits": { "max_nodes": 64 }
        }"#;
        temp_file.write_all(config_json.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(Some(temp_file.path().to_path_buf()), None).unwrap();
        assert_eq!(config.mode, 0o700);
        assert_eq!(config.uid, 1000);
        assert_eq!(config.gid, 0);
        assert_eq!(config.memory.max_bytes_in_memory, Some(1048576));
        assert_eq!(config.limits.max_nodes, Some(64));
        assert_eq!(config.limits.max_open_handles, 65536);
    }

    #[test]
    fn test_option_string_overrides_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(br#"{ "mode": 448 }"#).unwrap();
        temp_file.flush().unwrap();

        let config =
            load_config(Some(temp_file.path().to_path_buf()), Some("mode=1777,noatime")).unwrap();
        assert_eq!(config.mode, 0o1777);

        let err = load_config(None, Some("mode=8")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FsError>(),
            Some(FsError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_config_loading_rejects_bad_json() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{ mode: ").unwrap();
        temp_file.flush().unwrap();
        assert!(load_config(Some(temp_file.path().to_path_buf()), None).is_err());
    }
}
