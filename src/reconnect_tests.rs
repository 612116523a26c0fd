#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::channel::StateName;
    use crate::events::{
        Action, ChannelCommand, ChannelEvent, CommandResponse, RelayerNotification,
    };
    use crate::util::test_utils::*;
    use crate::wire::Message;

    #[test]
    fn reconnect_replays_unacked_add() {
        let (mut a, mut b) = establish_channel(0, false);
        let (_r, hash) = make_payment(71);

        // the add is sent but never delivered: the link drops first
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(20_000_000, hash, FUNDING_HEIGHT + 20, false),
        )));
        assert_eq!(sent_messages(&add_actions).len(), 1);

        a.process(ChannelEvent::Disconnected);
        b.process(ChannelEvent::Disconnected);
        assert_eq!(a.state_name(), StateName::Offline);
        assert_eq!(b.state_name(), StateName::Offline);

        let b_actions = b.process(ChannelEvent::Reconnected);
        assert!(sent_messages(&b_actions).is_empty());
        assert_eq!(b.state_name(), StateName::Normal);

        let a_actions = a.process(ChannelEvent::Reconnected);
        assert_eq!(a.state_name(), StateName::Normal);
        let replayed = sent_messages(&a_actions);
        // exactly the lost update_add_htlc comes back, followed by the
        // automatic signing round
        assert!(matches!(replayed[0], Message::UpdateAddHtlc(ref m) if m.id == 0));
        assert!(replayed.iter().any(|m| matches!(m, Message::CommitSig(_))));

        // the interrupted round completes as if nothing happened
        route(&mut a, &mut b, a_actions, vec![]);
        let ca = commitments_of(&a);
        let cb = commitments_of(&b);
        assert_eq!(ca.local_commit.index, 1);
        assert_eq!(cb.local_commit.index, 1);
        assert_eq!(ca.local_commit.spec.htlcs.len(), 1);
        assert_eq!(cb.local_commit.spec.htlcs.len(), 1);
        assert!(ca.unacked_messages.is_empty());
    }

    #[test]
    fn offline_channel_still_queues_adds() {
        let (mut a, mut b) = establish_channel(0, false);
        let (_r, hash) = make_payment(72);

        a.process(ChannelEvent::Disconnected);
        b.process(ChannelEvent::Disconnected);

        // adding while offline only queues the change and binds the origin
        let actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(make_add_cmd(
            15_000_000,
            hash,
            FUNDING_HEIGHT + 25,
            false,
        ))));
        assert!(sent_messages(&actions).is_empty());
        assert!(actions.iter().any(|act| matches!(act, Action::Reply(CommandResponse::Ok))));
        assert!(actions
            .iter()
            .any(|act| matches!(act, Action::Relayer(RelayerNotification::Bind { .. }))));
        assert_eq!(a.state_name(), StateName::Offline);

        b.process(ChannelEvent::Reconnected);
        let a_actions = a.process(ChannelEvent::Reconnected);
        // the queued add replays and signing resumes
        assert!(sent_messages(&a_actions)
            .iter()
            .any(|m| matches!(m, Message::UpdateAddHtlc(_))));
        route(&mut a, &mut b, a_actions, vec![]);
        assert_eq!(commitments_of(&a).local_commit.spec.htlcs.len(), 1);
        assert_eq!(commitments_of(&b).local_commit.spec.htlcs.len(), 1);
    }

    #[test]
    fn reconnect_before_funding_replays_last_message() {
        let mut a = crate::channel::Channel::new(make_node_params(1));
        let mut b = crate::channel::Channel::new(make_node_params(2));
        let a_actions = a.process(ChannelEvent::InitFunder(make_init_funder(2, FUNDING_SAT, 0)));
        b.process(ChannelEvent::InitFundee(crate::events::InitFundee {
            remote_node_id: make_node_params(1).node_id,
            local_params: make_local_params(20, false),
        }));
        route(&mut a, &mut b, a_actions, vec![]);

        // funder waits for the funding tx; fundee waits for funding_created
        assert_eq!(a.state_name(), StateName::WaitForFundingInternal);
        assert_eq!(b.state_name(), StateName::WaitForFundingCreated);

        b.process(ChannelEvent::Disconnected);
        let b_actions = b.process(ChannelEvent::Reconnected);
        assert!(matches!(
            sent_messages(&b_actions)[..],
            [Message::AcceptChannel(_)]
        ));
        assert_eq!(b.state_name(), StateName::WaitForFundingCreated);
    }

    #[test]
    fn watch_events_are_handled_while_offline() {
        let (mut a, b) = establish_channel(0, false);
        a.process(ChannelEvent::Disconnected);

        // the peer publishes its commitment while we are offline
        let b_commit = commitments_of(&b).local_commit.publishable_txs.commit_tx.clone();
        a.process(ChannelEvent::Watch(crate::events::WatchEvent::Spent {
            tag: crate::events::BitcoinEventTag::FundingSpent,
            tx: b_commit,
        }));
        assert_eq!(a.state_name(), StateName::Closing);
    }

    #[test]
    fn getstate_works_everywhere() {
        let (mut a, _b) = establish_channel(0, false);
        let actions = a.process(ChannelEvent::Command(ChannelCommand::GetState));
        assert!(matches!(
            actions[..],
            [Action::Reply(CommandResponse::State(StateName::Normal))]
        ));
        a.process(ChannelEvent::Disconnected);
        let actions = a.process(ChannelEvent::Command(ChannelCommand::GetState));
        assert!(matches!(
            actions[..],
            [Action::Reply(CommandResponse::State(StateName::Offline))]
        ));
        let actions = a.process(ChannelEvent::Command(ChannelCommand::GetInfo));
        match &actions[..] {
            [Action::Reply(CommandResponse::Info(info))] => {
                assert_eq!(info.to_local_msat, FUNDING_SAT * 1000);
                assert_eq!(info.htlcs_in_flight, 0);
            }
            other => panic!("expected info reply, got {:?}", other),
        }
    }
}
