use base64::Engine;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, TerminalSize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{Frame, INITIAL_COLS, INITIAL_ROWS};
use crate::Error;

/// Handles returned once the harness container's exec stream is live:
/// writing to `stdin` reaches the container's stdin, and `size` forwards
/// terminal resizes. The backend tears itself down (and fires `on_closed`)
/// when the exec stream ends, whether from `cancel` or the process exiting.
pub struct RunningBackend {
    pub stdin: mpsc::UnboundedSender<Vec<u8>>,
    pub size: Option<mpsc::Sender<(u16, u16)>>,
    pub cancel: CancellationToken,
}

/// Starts an interactive exec session against `pod`'s harness container and
/// wires stdin/stdout/resize plumbing, calling `on_stdout` for every chunk of
/// output and `on_closed` once the stream ends for any reason.
pub async fn start(
    client: kube::Client,
    namespace: &str,
    pod: &str,
    on_stdout: impl Fn(Frame) + Send + Sync + 'static,
    on_closed: impl FnOnce() + Send + 'static,
) -> Result<RunningBackend, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let params = AttachParams::interactive_tty().container("harness");
    let mut attached = api
        .exec(pod, vec!["sh".to_string()], &params)
        .await
        .map_err(Error::from)?;

    let cancel = CancellationToken::new();
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let size_tx = attached.terminal_size().inspect(|tx| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(TerminalSize {
                    width: INITIAL_COLS,
                    height: INITIAL_ROWS,
                })
                .await;
        });
    });
    let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(8);
    if let Some(inner) = size_tx.clone() {
        tokio::spawn(async move {
            while let Some((cols, rows)) = resize_rx.recv().await {
                if inner
                    .send(TerminalSize {
                        width: cols,
                        height: rows,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    if let Some(mut writer) = attached.stdin() {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = stdin_rx.recv() => {
                        match chunk {
                            Some(bytes) => {
                                if writer.write_all(&bytes).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    if let Some(mut reader) = attached.stdout() {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = reader.read(&mut buf) => {
                        match result {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let encoded = base64::engine::general_purpose::STANDARD.encode(&buf[..n]);
                                on_stdout(Frame::Stdout { data: encoded });
                            }
                        }
                    }
                }
            }
            on_closed();
        });
    }

    Ok(RunningBackend {
        stdin: stdin_tx,
        size: Some(resize_tx),
        cancel,
    })
}
