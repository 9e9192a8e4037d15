// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A minimal in-process server speaking the same wire framing as the
//! production client, used to drive the end-to-end scenarios below over a
//! real loopback TCP socket.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use region_ipc_client::wire::{self, RequestFrame};
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::Mutex,
    task::JoinHandle,
};

pub enum Reply {
    Value(Vec<u8>),
    Error(String, String),
}

/// Accepts exactly one connection and replies to every request it reads
/// according to `handler`, after an optional fixed delay. Counts ping
/// frames it observes while a reply is pending.
pub struct TestServer {
    pub addr: SocketAddr,
    pub ping_count: Arc<AtomicUsize>,
    _accept: JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn<F>(reply_delay: Duration, handler: F) -> Self
    where F: Fn(i32, Vec<u8>) -> Reply + Send + Sync + 'static {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let ping_count = Arc::new(AtomicUsize::new(0));
        let ping_count_for_task = Arc::clone(&ping_count);
        let handler = Arc::new(handler);

        let accept = tokio::spawn(async move {
            if let Ok((stream, _peer)) = listener.accept().await {
                handle_connection(stream, reply_delay, handler, ping_count_for_task).await;
            }
        });

        Self { addr, ping_count, _accept: accept }
    }
}

async fn handle_connection<F>(
    stream: TcpStream,
    reply_delay: Duration,
    handler: Arc<F>,
    ping_count: Arc<AtomicUsize>,
) where
    F: Fn(i32, Vec<u8>) -> Reply + Send + Sync + 'static,
{
    let (mut read_half, write_half) = stream.into_split();
    let write_half: Arc<Mutex<OwnedWriteHalf>> = Arc::new(Mutex::new(write_half));

    if wire::read_header(&mut read_half).await.is_err() {
        return;
    }

    loop {
        match wire::read_request_frame(&mut read_half).await {
            Ok(RequestFrame::Ping) => {
                ping_count.fetch_add(1, Ordering::SeqCst);
            },
            Ok(RequestFrame::Request { call_id, payload }) => {
                let handler = Arc::clone(&handler);
                let write_half = Arc::clone(&write_half);
                tokio::spawn(async move {
                    if !reply_delay.is_zero() {
                        tokio::time::sleep(reply_delay).await;
                    }
                    let mut w = write_half.lock().await;
                    let result = match handler(call_id, payload) {
                        Reply::Value(v) => wire::write_value_response(&mut *w, call_id, &v).await,
                        Reply::Error(class_name, message) => {
                            wire::write_error_response(&mut *w, call_id, &class_name, &message)
                                .await
                        },
                    };
                    let _ = result;
                });
            },
            Err(_io_err) => break,
        }
    }
}
