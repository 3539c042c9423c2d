use crate::config::DEFAULT_LOG_DIRECTIVE;
use crate::events::Notice;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;

/// Метки времени в локальной зоне, как в остальных логах клиента
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = chrono::Local::now();
        write!(w, "[{}]", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Логирование с временными метками; RUST_LOG имеет приоритет.
/// Повторная инициализация молча игнорируется.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime)
        .with_target(true)
        .try_init();
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                debug!(
                    "STATS {moment}: {}:{}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

/// Отправка уведомлений в UI; без получателя уведомления только логируются
#[derive(Clone, Default)]
pub struct Notifier {
    ui: Option<UnboundedSender<Notice>>,
}

impl Notifier {
    pub fn new(ui: UnboundedSender<Notice>) -> Self {
        Self { ui: Some(ui) }
    }

    pub fn silent() -> Self {
        Self { ui: None }
    }

    pub fn emit(&self, notice: Notice) {
        debug!("emit {:?}", notice);
        match &self.ui {
            Some(ui) => {
                if let Err(e) = ui.send(notice) {
                    warn!("Failed to emit notice {:?}: receiver dropped", e.0);
                }
            }
            None => debug!("No UI receiver attached, notice dropped"),
        }
    }
}
