// ===============================
// src/recorder.rs
// ===============================
//
// Journal JSONL (audit saja, tidak pernah dibaca ulang):
// - satu Event per baris, append
// - BufWriter, flush tiap 1s atau tiap 256 event
// - parent directory dibuat otomatis
// - tulis gagal -> reopen sekali, lalu event di-drop
//
// ENV: `RECORD_FILE=/path/to/events.jsonl` (lihat main.rs).
//
use std::io;
use std::path::Path;

use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 256;
const QUEUE: usize = 8192;

async fn open_writer(path: &str) -> io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Start the journal task. It drains and flushes once every sender is dropped,
/// so awaiting the handle after that loses nothing.
pub fn spawn(path: String) -> (mpsc::Sender<Event>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE);
    (tx, tokio::spawn(run(rx, path)))
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, journal disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut writer, &line).await {
                    warn!(?e, "recorder: write failed, reopening");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, "recorder: write failed again after reopen, drop event");
                        continue;
                    }
                }
                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
            _ = tick.tick() => {
                if since_last_flush > 0 {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decision, Fill};

    #[tokio::test]
    async fn journals_one_event_per_line() {
        let dir = std::env::temp_dir().join(format!("mtf_bot_rec_{}", std::process::id()));
        let path = dir.join("events.jsonl").to_string_lossy().to_string();
        let (tx, rx) = mpsc::channel(8);
        tx.send(Event::Decision { symbol: "BTCUSDT".into(), decision: Decision::Up, ts_ms: 1 }).await.unwrap();
        tx.send(Event::Fill(Fill { symbol: "BTCUSDT".into(), realized_pnl: -3.5, ts_ms: 2 })).await.unwrap();
        drop(tx);
        run(rx, path.clone()).await;

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"Decision\""));
        let back: Event = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(back, Event::Fill(f) if f.realized_pnl == -3.5));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn closing_senders_drains_before_the_task_ends() {
        let dir = std::env::temp_dir().join(format!("mtf_bot_rec_drain_{}", std::process::id()));
        let path = dir.join("events.jsonl").to_string_lossy().to_string();
        let (tx, handle) = spawn(path.clone());
        let monitor_tx = tx.clone();
        for i in 0..10 {
            tx.send(Event::Note(format!("cycle {i}"))).await.unwrap();
        }
        monitor_tx.send(Event::Note("last".into())).await.unwrap();
        drop(tx);
        drop(monitor_tx);
        handle.await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text.lines().count(), 11);
        assert!(text.lines().last().unwrap().contains("last"));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
