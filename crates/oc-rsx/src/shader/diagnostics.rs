//! Shader failure dumps and user alerts

use super::compiler::CompileUnit;
use oc_core::ShaderCacheError;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Minimum time between two user-facing shader alerts
pub const ALERT_INTERVAL: Duration = Duration::from_secs(10);

/// User-facing notice about a shader that failed to compile
#[derive(Debug, Clone)]
pub struct ShaderAlert {
    pub stage: &'static str,
    pub label: String,
    pub target: String,
    pub diagnostics: String,
    /// Where the source and diagnostics were written, if that worked
    pub dump_path: Option<PathBuf>,
}

impl ShaderAlert {
    /// Text for a message box
    pub fn message(&self) -> String {
        let mut msg = format!(
            "Failed to compile {} shader!\n\
             This usually happens with outdated GPU drivers.\n\n\
             Debug info ({}):\n{}",
            self.stage, self.target, self.diagnostics
        );
        if let Some(path) = &self.dump_path {
            msg.push_str(&format!("\n\nThe shader source was saved to {}", path.display()));
        }
        msg
    }
}

/// Callback that shows an alert to the user (message box, OSD, ...)
pub type AlertHook = Arc<dyn Fn(&ShaderAlert) + Send + Sync>;

/// Shared by all stage caches of one backend
pub struct DiagnosticsSink {
    dump_dir: PathBuf,
    /// Also dump every generated source, not only failures
    dump_all_sources: AtomicBool,
    failure_count: AtomicU32,
    source_count: AtomicU32,
    suppress_alerts: AtomicBool,
    last_alert: Mutex<Option<Instant>>,
    hook: Mutex<Option<AlertHook>>,
}

impl DiagnosticsSink {
    pub fn new(
        dump_dir: impl Into<PathBuf>,
        dump_all_sources: bool,
        suppress_alerts: bool,
    ) -> Self {
        Self {
            dump_dir: dump_dir.into(),
            dump_all_sources: AtomicBool::new(dump_all_sources),
            failure_count: AtomicU32::new(0),
            source_count: AtomicU32::new(0),
            suppress_alerts: AtomicBool::new(suppress_alerts),
            last_alert: Mutex::new(None),
            hook: Mutex::new(None),
        }
    }

    pub fn set_alert_hook(&self, hook: AlertHook) {
        *self.hook.lock() = Some(hook);
    }

    pub fn set_suppress_alerts(&self, suppress: bool) {
        self.suppress_alerts.store(suppress, Ordering::Relaxed);
    }

    pub fn set_dump_all_sources(&self, dump: bool) {
        self.dump_all_sources.store(dump, Ordering::Relaxed);
    }

    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }

    /// Number of compile failures reported so far
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Record a compile failure: dump file, error log, and maybe an alert
    pub fn report_failure(
        &self,
        stage: &'static str,
        unit: &CompileUnit,
        diagnostics: &str,
    ) -> Option<PathBuf> {
        let index = self.failure_count.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dump_dir
            .join(format!("bad_{}_{:04}.txt", unit.stage.short_name(), index));

        let mut content = unit.source.clone();
        content.push_str(&format!(
            "\n// ---- {} (target {}, entry {}) ----\n",
            unit.label, unit.target, unit.entry_point
        ));
        for line in diagnostics.lines() {
            content.push_str("// ");
            content.push_str(line);
            content.push('\n');
        }

        let dump_path = match write_dump(&path, &content) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Could not write shader dump {}: {}", path.display(), e);
                None
            }
        };

        let err = ShaderCacheError::Compile {
            stage,
            target: unit.target.clone(),
            diagnostics: diagnostics.trim_end().to_string(),
        };
        error!("{} [{}]", err, unit.label);

        self.alert(ShaderAlert {
            stage,
            label: unit.label.clone(),
            target: unit.target.clone(),
            diagnostics: diagnostics.to_string(),
            dump_path: dump_path.clone(),
        });

        dump_path
    }

    /// Write generated source when source dumping is enabled
    pub fn dump_source(&self, unit: &CompileUnit) {
        if !self.dump_all_sources.load(Ordering::Relaxed) {
            return;
        }
        let index = self.source_count.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dump_dir
            .join(format!("{}_{:04}.txt", unit.stage.short_name(), index));
        if let Err(e) = write_dump(&path, &unit.source) {
            warn!("Could not write shader dump {}: {}", path.display(), e);
        }
    }

    /// Returns whether the alert was shown
    fn alert(&self, alert: ShaderAlert) -> bool {
        if self.suppress_alerts.load(Ordering::Relaxed) {
            return false;
        }

        {
            let mut last = self.last_alert.lock();
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev) < ALERT_INTERVAL {
                    return false;
                }
            }
            *last = Some(now);
        }

        let hook = self.hook.lock().clone();
        match hook {
            Some(hook) => hook(&alert),
            None => error!("{}", alert.message()),
        }
        true
    }
}

fn write_dump(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::types::{CompileFlags, ShaderStage};
    use std::sync::atomic::AtomicUsize;

    fn unit() -> CompileUnit {
        CompileUnit {
            stage: ShaderStage::GEOMETRY,
            label: "geometry 00000001".to_string(),
            source: "void main() { broken".to_string(),
            entry_point: "main",
            target: "gs_5_0".to_string(),
            flags: CompileFlags::OPTIMIZE,
        }
    }

    #[test]
    fn test_failure_dumps_are_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiagnosticsSink::new(dir.path(), false, true);

        let first = sink.report_failure("geometry", &unit(), "error X3000: syntax error").unwrap();
        let second = sink.report_failure("geometry", &unit(), "again").unwrap();

        assert_eq!(first.file_name().unwrap(), "bad_gs_0000.txt");
        assert_eq!(second.file_name().unwrap(), "bad_gs_0001.txt");
        let content = fs::read_to_string(first).unwrap();
        assert!(content.starts_with("void main() { broken"));
        assert!(content.contains("// error X3000: syntax error"));
        assert_eq!(sink.failure_count(), 2);
    }

    #[test]
    fn test_alerts_are_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiagnosticsSink::new(dir.path(), false, false);
        let shown = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&shown);
        sink.set_alert_hook(Arc::new(move |alert: &ShaderAlert| {
            assert!(alert.message().contains("gs_5_0"));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..5 {
            sink.report_failure("geometry", &unit(), "bad");
        }
        assert_eq!(shown.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_suppressed_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiagnosticsSink::new(dir.path(), false, true);
        let shown = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&shown);
        sink.set_alert_hook(Arc::new(move |_: &ShaderAlert| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        sink.report_failure("geometry", &unit(), "bad");
        assert_eq!(shown.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_source_dumps_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        DiagnosticsSink::new(dir.path(), false, true).dump_source(&unit());
        assert!(!dir.path().join("gs_0000.txt").exists());

        let sink = DiagnosticsSink::new(dir.path(), true, true);
        sink.dump_source(&unit());
        assert!(dir.path().join("gs_0000.txt").exists());

        sink.set_dump_all_sources(false);
        sink.dump_source(&unit());
        assert!(!dir.path().join("gs_0001.txt").exists());
    }
}
