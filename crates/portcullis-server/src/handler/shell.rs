//! Legacy interactive mode: a TOTP-gated local shell on a PTY, with raw
//! output mirrored to a per-session recording file.

use pty_process::{OwnedWritePty, Pty, Size};
use russh::server::{Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::ServerHandler;
use crate::mfa::{unix_now, verify_totp};
use crate::recording::create_recording;

const MAX_CODE_ATTEMPTS: u8 = 3;
const DEFAULT_SHELL: &str = "/bin/bash";
const CODE_PROMPT: &[u8] = b"MFA Code: ";

/// Interactive-mode state for the one active session channel.
pub(super) struct ShellChannel {
    id: ChannelId,
    size: (u16, u16),
    stage: ShellStage,
}

enum ShellStage {
    /// Channel accepted, waiting for the shell request.
    Opened,
    /// MOTD shown, collecting a one-time code.
    AwaitingCode { buffer: Vec<u8>, attempts: u8 },
    /// Shell running on the PTY.
    Running {
        writer: OwnedWritePty,
        shutdown: Option<oneshot::Sender<()>>,
    },
}

impl ServerHandler {
    pub(super) fn handle_shell_channel_open(
        &mut self,
        channel: Channel<Msg>,
    ) -> Result<bool, russh::Error> {
        if self.session.is_none() || self.shell.is_some() {
            return Ok(false);
        }
        self.shell = Some(ShellChannel {
            id: channel.id(),
            size: (80, 24),
            stage: ShellStage::Opened,
        });
        Ok(true)
    }

    pub(super) fn handle_pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        row_height: u32,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let Some(shell) = self.shell.as_mut().filter(|s| s.id == channel) else {
            return session.channel_failure(channel);
        };
        shell.size = clamp_size(col_width, row_height);
        session.channel_success(channel)
    }

    pub(super) async fn handle_window_change(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
    ) -> Result<(), russh::Error> {
        if let Some(shell) = self.shell.as_mut().filter(|s| s.id == channel) {
            shell.size = clamp_size(col_width, row_height);
            if let ShellStage::Running { writer, .. } = &shell.stage {
                let (cols, rows) = shell.size;
                if let Err(err) = writer.resize(Size::new(rows, cols)) {
                    warn!(error = %err, "pty resize failed");
                }
            }
        }
        Ok(())
    }

    pub(super) async fn handle_shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let Some(bastion_session) = self.session.clone() else {
            return session.channel_failure(channel);
        };
        let Some(shell) = self.shell.as_mut().filter(|s| s.id == channel) else {
            return session.channel_failure(channel);
        };
        if !matches!(shell.stage, ShellStage::Opened) {
            return session.channel_failure(channel);
        }
        session.channel_success(channel)?;

        self.send_line(
            session,
            channel,
            &format!("Session {} opened", bastion_session.id),
        )?;
        if !self.state.config.motd.is_empty() {
            self.send_line(session, channel, &self.state.config.motd)?;
        }
        self.send_bytes(session, channel, CODE_PROMPT)?;

        let shell = self.shell.as_mut().filter(|s| s.id == channel).expect("shell state");
        shell.stage = ShellStage::AwaitingCode {
            buffer: Vec::new(),
            attempts: 0,
        };
        Ok(())
    }

    pub(super) async fn handle_shell_data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        // Process under the state borrow, then act on the outcome once the
        // borrow is released.
        enum Outcome {
            Ignore,
            Echo { bytes: Vec<u8>, code: Option<String> },
            Cancelled,
            PtyWriteFailed,
        }

        let outcome = match self.shell.as_mut().filter(|s| s.id == channel) {
            None => Outcome::Ignore,
            Some(shell) => match &mut shell.stage {
                ShellStage::Opened => Outcome::Ignore,
                ShellStage::AwaitingCode { buffer, .. } => {
                    let mut echo = Vec::new();
                    let mut submitted = None;
                    let mut cancelled = false;
                    for &byte in data {
                        match byte {
                            // Ctrl+C / Ctrl+D cancel the prompt and the session.
                            0x03 | 0x04 => {
                                cancelled = true;
                                break;
                            }
                            0x7f | 0x08 => {
                                if buffer.pop().is_some() {
                                    echo.extend_from_slice(b"\x08 \x08");
                                }
                            }
                            // Ctrl+U clears the line.
                            0x15 => {
                                for _ in 0..buffer.len() {
                                    echo.extend_from_slice(b"\x08 \x08");
                                }
                                buffer.clear();
                            }
                            b'\r' | b'\n' => {
                                submitted = Some(String::from_utf8_lossy(buffer).to_string());
                                buffer.clear();
                                break;
                            }
                            byte => {
                                buffer.push(byte);
                                echo.push(byte);
                            }
                        }
                    }
                    if cancelled {
                        Outcome::Cancelled
                    } else {
                        Outcome::Echo {
                            bytes: echo,
                            code: submitted,
                        }
                    }
                }
                ShellStage::Running { writer, .. } => {
                    if writer.write_all(data).await.is_err() {
                        Outcome::PtyWriteFailed
                    } else {
                        Outcome::Ignore
                    }
                }
            },
        };

        match outcome {
            Outcome::Ignore => Ok(()),
            Outcome::Cancelled => {
                self.send_bytes(session, channel, b"\r\n")?;
                self.close_shell_channel(channel, session, "mfa prompt cancelled")
            }
            Outcome::PtyWriteFailed => {
                self.close_shell_channel(channel, session, "pty write failed")
            }
            Outcome::Echo { bytes, code } => {
                self.send_bytes(session, channel, &bytes)?;
                let Some(code) = code else {
                    return Ok(());
                };
                self.send_bytes(session, channel, b"\r\n")?;

                let account = self.session.as_ref().expect("session").account.clone();
                if verify_totp(&account.totp_secret, &code, unix_now()) {
                    self.start_shell(channel, session).await
                } else {
                    let attempts = match self.shell.as_mut().filter(|s| s.id == channel) {
                        Some(shell) => match &mut shell.stage {
                            ShellStage::AwaitingCode { attempts, .. } => {
                                *attempts += 1;
                                *attempts
                            }
                            _ => return Ok(()),
                        },
                        None => return Ok(()),
                    };
                    if attempts >= MAX_CODE_ATTEMPTS {
                        self.close_shell_channel(channel, session, "too many invalid mfa codes")
                    } else {
                        self.send_bytes(session, channel, CODE_PROMPT)
                    }
                }
            }
        }
    }

    pub(super) fn handle_shell_channel_gone(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), russh::Error> {
        if let Some(mut shell) = self.shell.take_if(|s| s.id == channel) {
            if let ShellStage::Running { shutdown, .. } = &mut shell.stage
                && let Some(tx) = shutdown.take()
            {
                let _ = tx.send(());
            }
        }
        Ok(())
    }

    /// Spawn the account's shell on a fresh PTY and wire up both directions
    /// plus the recording mirror.
    async fn start_shell(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let bastion_session = self.session.clone().expect("session");
        let shell_path = bastion_session
            .account
            .shell
            .clone()
            .unwrap_or_else(|| DEFAULT_SHELL.to_string());

        let (cols, rows) = self
            .shell
            .as_ref()
            .filter(|s| s.id == channel)
            .map(|s| s.size)
            .unwrap_or((80, 24));

        let pty = match Pty::new() {
            Ok(pty) => pty,
            Err(err) => {
                warn!(id = %bastion_session.id, error = %err, "could not allocate pty");
                return self.close_shell_channel(channel, session, "pty allocation failed");
            }
        };
        let pts = match pty.pts() {
            Ok(pts) => pts,
            Err(err) => {
                warn!(id = %bastion_session.id, error = %err, "could not open pts");
                return self.close_shell_channel(channel, session, "pty allocation failed");
            }
        };
        let mut child = match pty_process::Command::new(&shell_path).spawn(&pts) {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    id = %bastion_session.id,
                    shell = %shell_path,
                    error = %err,
                    "could not start shell"
                );
                return self.close_shell_channel(channel, session, "shell start failed");
            }
        };
        drop(pts);

        let (mut reader, writer) = pty.into_split();
        if let Err(err) = writer.resize(Size::new(rows, cols)) {
            warn!(error = %err, "initial pty resize failed");
        }

        let mut recording =
            match create_recording(&self.state.config.recording_path, bastion_session.id) {
                Ok((file, path)) => {
                    info!(id = %bastion_session.id, path = %path.display(), "recording session");
                    Some(file)
                }
                Err(err) => {
                    warn!(id = %bastion_session.id, error = %err, "couldn't create recording file");
                    None
                }
            };

        info!(id = %bastion_session.id, shell = %shell_path, "shell created");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = session.handle();
        let session_id = bastion_session.id;
        tokio::spawn(async move {
            let pump = async {
                let mut buffer = vec![0u8; 1024];
                loop {
                    match reader.read(&mut buffer).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if handle
                                .data(channel, CryptoVec::from_slice(&buffer[..n]))
                                .await
                                .is_err()
                            {
                                break;
                            }
                            if let Some(recording) = recording.as_mut() {
                                let _ = recording.write_all(&buffer[..n]).await;
                            }
                        }
                    }
                }
            };
            tokio::select! {
                _ = pump => {}
                _ = &mut shutdown_rx => {
                    let _ = child.kill().await;
                }
            }
            let code = child
                .wait()
                .await
                .ok()
                .and_then(|status| status.code())
                .unwrap_or(0);
            let _ = handle.exit_status_request(channel, code as u32).await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
            info!(id = %session_id, "session and shell closed");
        });

        let shell = self.shell.as_mut().filter(|s| s.id == channel).expect("shell state");
        shell.stage = ShellStage::Running {
            writer,
            shutdown: Some(shutdown_tx),
        };
        Ok(())
    }

    fn close_shell_channel(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
        reason: &str,
    ) -> Result<(), russh::Error> {
        info!(reason, "closing interactive channel");
        self.shell.take_if(|s| s.id == channel);
        session.close(channel)
    }
}

fn clamp_size(col_width: u32, row_height: u32) -> (u16, u16) {
    let cols = col_width.clamp(1, u16::MAX as u32) as u16;
    let rows = row_height.clamp(1, u16::MAX as u32) as u16;
    (cols, rows)
}
