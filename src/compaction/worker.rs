//! The two dispatch loops.
//!
//! The mem loop owns memtable flushes; the table loop owns every table
//! compaction and the quiescence protocol. Both consume a command channel,
//! race every blocking wait against shutdown, and swallow the transact
//! sentinel at their boundary, answering any commands still in flight
//! with the closed error.

use std::sync::Arc;

use crate::{
    compaction::{mem, table, Cmd, CmdAck, CompactionCore},
    error::Error,
};

/// Long-lived memtable-flush loop.
pub(crate) async fn mem_loop(core: Arc<CompactionCore>) {
    loop {
        tokio::select! {
            cmd = core.chans.mcomp_cmd_rx.recv_async() => {
                let cmd = match cmd {
                    Ok(cmd) => cmd,
                    Err(_) => return,
                };
                match cmd {
                    Cmd::Idle { ack } => match mem::mem_compaction(&core).await {
                        Ok(()) => ack.ack(Ok(())),
                        Err(_) => {
                            ack.ack(Err(Error::Closed));
                            return;
                        }
                    },
                    Cmd::Trigger | Cmd::Range { .. } => {
                        unreachable!("mem loop: unexpected command kind")
                    }
                }
            }
            _ = core.shutdown.wait() => return,
        }
    }
}

/// Long-lived table-compaction loop.
pub(crate) async fn table_loop(core: Arc<CompactionCore>) {
    let mut ack_q: Vec<CmdAck> = Vec::new();
    table_loop_inner(&core, &mut ack_q).await;
    for ack in ack_q.drain(..) {
        ack.ack(Err(Error::Closed));
    }
}

async fn table_loop_inner(core: &Arc<CompactionCore>, ack_q: &mut Vec<CmdAck>) {
    loop {
        let mut cmd = None;
        if table::table_need_compaction(core) {
            // Work is pending: take whatever is immediately available and
            // keep compacting.
            if let Ok(resume) = core.chans.tcomp_pause_rx.try_recv() {
                if core.pause(resume).await.is_err() {
                    return;
                }
                continue;
            }
            if core.is_closed() {
                return;
            }
            if let Ok(c) = core.chans.tcomp_cmd_rx.try_recv() {
                cmd = Some(c);
            }
        } else {
            // Quiescent: everyone waiting for idle gets their answer now.
            for ack in ack_q.drain(..) {
                ack.ack(Ok(()));
            }
            tokio::select! {
                c = core.chans.tcomp_cmd_rx.recv_async() => match c {
                    Ok(c) => cmd = Some(c),
                    Err(_) => return,
                },
                resume = core.chans.tcomp_pause_rx.recv_async() => match resume {
                    Ok(resume) => {
                        if core.pause(resume).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    Err(_) => return,
                },
                _ = core.shutdown.wait() => return,
            }
        }

        if let Some(cmd) = cmd {
            match cmd {
                Cmd::Idle { ack } => ack_q.push(ack),
                Cmd::Trigger => {}
                Cmd::Range {
                    level,
                    umin,
                    umax,
                    ack,
                } => match table::table_range_compaction(core, level, &umin, &umax).await {
                    Ok(()) => ack.ack(Ok(())),
                    Err(_) => {
                        ack.ack(Err(Error::Closed));
                        return;
                    }
                },
            }
        }

        if table::table_auto_compaction(core).await.is_err() {
            return;
        }
    }
}
