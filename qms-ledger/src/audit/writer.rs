//! 監査イベントの非同期ライター
//!
//! mpscチャネルでイベントを受信し、単一のバックグラウンドタスクが
//! 受信順に`ChainAppender`へ追記する。呼び出し側は追記結果を待たない。

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::audit::appender::ChainAppender;
use crate::audit::types::NewAuditEvent;
use crate::common::error::{LedgerError, LedgerResult};
use crate::config::{get_env_flag, get_env_parse};

/// フォールバック行の説明に付ける接頭辞
pub const CHAIN_ERROR_PREFIX: &str = "[CHAIN_ERROR]";

/// 監査ライター設定
#[derive(Debug, Clone)]
pub struct AuditLogWriterConfig {
    /// キュー上限イベント数。デフォルト: 10000
    pub capacity: usize,
    /// チェーン追記失敗時に未チェーン行として保存するか。デフォルト: true
    pub fallback_unchained: bool,
}

impl Default for AuditLogWriterConfig {
    fn default() -> Self {
        Self {
            capacity: get_env_parse("QMS_LEDGER_WRITER_CAPACITY", 10_000usize).max(1),
            fallback_unchained: get_env_flag("QMS_LEDGER_WRITER_FALLBACK", true),
        }
    }
}

enum WriterMessage {
    Record(NewAuditEvent),
    Flush(oneshot::Sender<()>),
}

/// 監査イベントの非同期ライター
///
/// Clone可能（senderのクローン）。全てのクローンがDropされると
/// キューを処理し切ってからバックグラウンドタスクが終了する。
#[derive(Clone)]
pub struct AuditLogWriter {
    sender: mpsc::Sender<WriterMessage>,
}

impl AuditLogWriter {
    /// 新しいAuditLogWriterを作成し、バックグラウンドタスクを起動
    pub fn new(appender: ChainAppender, config: AuditLogWriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);

        tokio::spawn(Self::background_task(rx, appender, config));

        Self { sender: tx }
    }

    /// イベントをキューに送信（ブロックしない）
    ///
    /// キューが満杯・停止済みの場合はイベントを破棄してエラーログを出す。
    pub fn send(&self, event: NewAuditEvent) {
        if let Err(e) = self.sender.try_send(WriterMessage::Record(event)) {
            let action = match &e {
                mpsc::error::TrySendError::Full(WriterMessage::Record(ev))
                | mpsc::error::TrySendError::Closed(WriterMessage::Record(ev)) => {
                    ev.action.clone()
                }
                _ => String::new(),
            };
            error!(action = %action, "Failed to queue audit event: {}", e);
        }
    }

    /// キューに空きができるまで待って送信
    pub async fn send_wait(&self, event: NewAuditEvent) -> LedgerResult<()> {
        self.sender
            .send(WriterMessage::Record(event))
            .await
            .map_err(|_| LedgerError::Internal("audit writer has stopped".to_string()))
    }

    /// これまでに送信したイベントが全て処理されるまで待つ
    pub async fn flush(&self) -> LedgerResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.sender
            .send(WriterMessage::Flush(ack_tx))
            .await
            .map_err(|_| LedgerError::Internal("audit writer has stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| LedgerError::Internal("audit writer has stopped".to_string()))
    }

    async fn background_task(
        mut rx: mpsc::Receiver<WriterMessage>,
        appender: ChainAppender,
        config: AuditLogWriterConfig,
    ) {
        let mut written: u64 = 0;
        let mut fallbacks: u64 = 0;

        while let Some(message) = rx.recv().await {
            match message {
                WriterMessage::Record(event) => {
                    match Self::write_one(&appender, &config, event).await {
                        WriteOutcome::Chained => written += 1,
                        WriteOutcome::Fallback => fallbacks += 1,
                        WriteOutcome::Lost => {}
                    }
                }
                WriterMessage::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        info!(
            written,
            fallbacks, "Audit log writer background task stopped"
        );
    }

    async fn write_one(
        appender: &ChainAppender,
        config: &AuditLogWriterConfig,
        event: NewAuditEvent,
    ) -> WriteOutcome {
        let err = match appender.append(event.clone()).await {
            Ok(_) => return WriteOutcome::Chained,
            Err(err) => err,
        };

        warn!(
            action = %event.action,
            kind = err.kind(),
            "Chained append failed: {}",
            err
        );

        // 不正なイベントはフォールバックしても保存できない
        if !config.fallback_unchained || matches!(err, LedgerError::Validation(_)) {
            error!(action = %event.action, "Audit event lost");
            return WriteOutcome::Lost;
        }

        let fallback = match fallback_event(event, &err).prepare(Utc::now()) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Audit event lost: {}", e);
                return WriteOutcome::Lost;
            }
        };

        match appender.storage().insert_unchained(&[fallback]).await {
            Ok(ids) => {
                warn!(
                    id = ids.first().copied().unwrap_or_default(),
                    "Stored audit event without chain; run backfill to chain it"
                );
                WriteOutcome::Fallback
            }
            Err(e) => {
                error!("Audit event lost, fallback insert failed: {}", e);
                WriteOutcome::Lost
            }
        }
    }
}

enum WriteOutcome {
    Chained,
    Fallback,
    Lost,
}

/// 追記失敗時に保存する未チェーン版のイベント
fn fallback_event(mut event: NewAuditEvent, err: &LedgerError) -> NewAuditEvent {
    event.description = Some(match event.description.take() {
        Some(desc) => format!("{} {}", CHAIN_ERROR_PREFIX, desc),
        None => CHAIN_ERROR_PREFIX.to_string(),
    });

    let mut metadata = match event.metadata.take() {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("originalMetadata".to_string(), other);
            map
        }
        None => Map::new(),
    };
    metadata.insert("chainError".to_string(), Value::String(err.to_string()));
    event.metadata = Some(Value::Object(metadata));
    event
}
