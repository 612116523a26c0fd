//! Tokio shell for the synchronous state machine.
//!
//! One task owns the [Channel] and drains a single mpsc inbox, fanning
//! actions out to the collaborator channels. Delayed self-messages
//! (announcement tick) are spawned as sleeps that feed the same inbox, so
//! ordering within the actor is preserved.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::channel::Channel;
use crate::events::{
    Action, BlockchainRequest, ChannelEvent, CommandResponse, NodeEvent, RelayerNotification,
    RouterMessage,
};
use crate::wire::Message;

/// How long a terminal channel keeps draining its inbox before stopping
const TERMINAL_DRAIN: Duration = Duration::from_secs(10);

/// Outbound endpoints of the channel actor
pub struct ChannelHandles {
    /// Peer wire, keyed by channel elsewhere
    pub peer: mpsc::UnboundedSender<Message>,
    /// Blockchain watcher/publisher
    pub blockchain: mpsc::UnboundedSender<BlockchainRequest>,
    /// HTLC relayer
    pub relayer: mpsc::UnboundedSender<RelayerNotification>,
    /// Gossip router
    pub router: mpsc::UnboundedSender<RouterMessage>,
    /// Node event stream
    pub events: mpsc::UnboundedSender<NodeEvent>,
    /// Command replies
    pub replies: mpsc::UnboundedSender<CommandResponse>,
}

fn dispatch(handles: &ChannelHandles, inbox: &mpsc::UnboundedSender<ChannelEvent>, action: Action) {
    match action {
        Action::SendMessage(m) => {
            let _ = handles.peer.send(m);
        }
        Action::Blockchain(r) => {
            let _ = handles.blockchain.send(r);
        }
        Action::Relayer(r) => {
            let _ = handles.relayer.send(r);
        }
        Action::Router(r) => {
            let _ = handles.router.send(r);
        }
        Action::Emit(e) => {
            let _ = handles.events.send(e);
        }
        Action::Reply(r) => {
            let _ = handles.replies.send(r);
        }
        Action::Schedule { delay_ms, event } => {
            let inbox = inbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = inbox.send(event);
            });
        }
    }
}

/// Spawn a channel actor. Returns its inbox and the task handle; the task
/// stops after the terminal drain window.
pub fn spawn(
    mut channel: Channel,
    handles: ChannelHandles,
) -> (mpsc::UnboundedSender<ChannelEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let inbox = tx.clone();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for action in channel.process(event) {
                dispatch(&handles, &inbox, action);
            }
            if channel.state().is_terminal() {
                break;
            }
        }
        // Answer stragglers for a grace period, then stop.
        let drain = async {
            while let Some(event) = rx.recv().await {
                for action in channel.process(event) {
                    dispatch(&handles, &inbox, action);
                }
            }
        };
        let _ = timeout(TERMINAL_DRAIN, drain).await;
        debug!("channel actor stopping in {}", channel.state_name());
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::{make_init_funder, make_node_params};

    fn make_handles() -> (
        ChannelHandles,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedReceiver<NodeEvent>,
    ) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (blockchain_tx, _blockchain_rx) = mpsc::unbounded_channel();
        let (relayer_tx, _relayer_rx) = mpsc::unbounded_channel();
        let (router_tx, _router_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (replies_tx, _replies_rx) = mpsc::unbounded_channel();
        (
            ChannelHandles {
                peer: peer_tx,
                blockchain: blockchain_tx,
                relayer: relayer_tx,
                router: router_tx,
                events: events_tx,
                replies: replies_tx,
            },
            peer_rx,
            events_rx,
        )
    }

    #[tokio::test]
    async fn funder_init_emits_open_channel() {
        let (handles, mut peer_rx, mut events_rx) = make_handles();
        let channel = Channel::new(make_node_params(1));
        let (inbox, _task) = spawn(channel, handles);

        inbox.send(ChannelEvent::InitFunder(make_init_funder(2, 1_000_000, 0))).unwrap();

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, NodeEvent::ChannelCreated { .. }));
        let msg = peer_rx.recv().await.unwrap();
        assert!(matches!(msg, Message::OpenChannel(_)));
    }
}
