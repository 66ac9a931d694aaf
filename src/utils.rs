use std::path::PathBuf;
use std::sync::OnceLock;

static TEST_RUN_ID: OnceLock<u64> = OnceLock::new();
static INIT_LOG: OnceLock<()> = OnceLock::new();

pub(crate) fn init_test_log() {
    INIT_LOG.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn test_dir(annot: &str) -> PathBuf {
    let run_id = TEST_RUN_ID.get_or_init(|| rand::random::<u64>());

    let thread = std::thread::current();
    let thread_name = thread.name().unwrap_or("unknown");
    let safe_thread_name = thread_name.replace("::", "_");

    // temp/rcluster_test/run_{id}/{test_function}/{annot}
    let path = std::env::temp_dir()
        .join("rcluster_test")
        .join(format!("run_{}", run_id))
        .join(safe_thread_name)
        .join(annot);
    if let Err(e) = std::fs::create_dir_all(&path) {
        eprintln!("Failed to create test directory {:?}: {}", path, e);
    }
    path
}
