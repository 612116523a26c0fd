#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::channel::StateName;
    use crate::commitments::Commitments;
    use crate::events::{
        Action, ChannelCommand, ChannelEvent, CmdFulfillHtlc, CommandResponse,
        RelayerNotification,
    };
    use crate::util::test_utils::*;
    use crate::wire::{Message, UpdateAddHtlc};

    fn assert_conserved(c: &Commitments) {
        let spec = &c.local_commit.spec;
        let htlc_sum: u64 = spec.htlcs.iter().map(|h| h.add.amount_msat).sum();
        assert_eq!(spec.to_local_msat + spec.to_remote_msat + htlc_sum, FUNDING_SAT * 1000);
    }

    #[test]
    fn one_htlc_fulfilled() {
        let (mut a, mut b) = establish_channel(0, false);
        let (preimage, hash) = make_payment(77);

        // A offers the HTLC and signs
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(60_000_000, hash, FUNDING_HEIGHT + 4, false),
        )));
        assert!(relayer_notifications(&add_actions)
            .iter()
            .any(|n| matches!(n, RelayerNotification::Bind { .. })));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);

        assert_eq!(commitments_of(&a).local_commit.index, 1);
        assert_eq!(commitments_of(&a).remote_commit.index, 1);
        assert_eq!(commitments_of(&b).local_commit.index, 1);
        assert_eq!(commitments_of(&b).local_commit.spec.htlcs.len(), 1);
        assert_conserved(commitments_of(&a));
        assert_conserved(commitments_of(&b));

        // the add is committed on both chains, so B's relayer was told
        // (B would be the forwarding node downstream)

        // B fulfills and signs
        let fulfill_actions = b.process(ChannelEvent::Command(ChannelCommand::FulfillHtlc(
            CmdFulfillHtlc { id: 0, payment_preimage: preimage, commit: false },
        )));
        let (a_out, _b_out) = route(&mut a, &mut b, vec![], fulfill_actions);
        assert!(relayer_notifications(&a_out)
            .iter()
            .any(|n| matches!(n, RelayerNotification::ForwardFulfill(f) if f.id == 0)));
        sign_round(&mut b, &mut a);

        let ca = commitments_of(&a);
        let cb = commitments_of(&b);
        assert_eq!(ca.local_commit.index, 2);
        assert_eq!(ca.remote_commit.index, 2);
        assert_eq!(cb.local_commit.index, 2);
        assert_eq!(cb.remote_commit.index, 2);
        assert!(ca.has_no_pending_htlcs());
        assert!(cb.has_no_pending_htlcs());
        assert_eq!(ca.local_commit.spec.to_local_msat, FUNDING_SAT * 1000 - 60_000_000);
        assert_eq!(cb.local_commit.spec.to_local_msat, 60_000_000);
        assert_conserved(ca);
        assert_conserved(cb);
    }

    #[test]
    fn peer_add_is_forwarded_after_revocation() {
        let (mut a, mut b) = establish_channel(200_000_000, false);
        let (_preimage, hash) = make_payment(78);

        // B offers to A; once both chains commit it, A's relayer gets a
        // ForwardAdd
        let add_actions = b.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(50_000_000, hash, FUNDING_HEIGHT + 6, false),
        )));
        route(&mut a, &mut b, vec![], add_actions);
        let (_b_out, a_out) = sign_round(&mut b, &mut a);
        let forwarded = a_out
            .iter()
            .chain(_b_out.iter())
            .filter_map(|act| match act {
                Action::Relayer(RelayerNotification::ForwardAdd(add)) => Some(add.id),
                _ => None,
            })
            .count();
        assert_eq!(forwarded, 1);
    }

    #[test]
    fn add_below_remote_minimum_is_rejected() {
        let (mut a, _b) = establish_channel(0, false);
        let (_r, hash) = make_payment(5);
        let actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(make_add_cmd(
            500,
            hash,
            FUNDING_HEIGHT + 4,
            false,
        ))));
        assert!(matches!(&actions[..], [Action::Reply(CommandResponse::Rejected(_))]));
        assert_eq!(a.state_name(), StateName::Normal);
    }

    #[test]
    fn add_violating_reserve_is_rejected() {
        let (mut a, _b) = establish_channel(0, false);
        let (_r, hash) = make_payment(6);
        // the whole balance cannot go in flight, the reserve must remain
        let actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(make_add_cmd(
            FUNDING_SAT * 1000,
            hash,
            FUNDING_HEIGHT + 4,
            false,
        ))));
        assert!(matches!(&actions[..], [Action::Reply(CommandResponse::Rejected(_))]));
    }

    #[test]
    fn unexpected_htlc_id_closes_unilaterally() {
        let (_a, mut b) = establish_channel(0, false);
        let (_r, hash) = make_payment(7);
        let rogue = UpdateAddHtlc {
            channel_id: commitments_of(&b).channel_id,
            id: 5,
            amount_msat: 10_000_000,
            payment_hash: hash,
            cltv_expiry: FUNDING_HEIGHT + 4,
            onion_routing_packet: vec![],
        };
        let actions = b.process(ChannelEvent::Message(Message::UpdateAddHtlc(rogue)));
        assert_eq!(b.state_name(), StateName::Closing);
        assert!(sent_messages(&actions).iter().any(|m| matches!(m, Message::Error(_))));
        match b.state() {
            crate::channel::ChannelState::Closing(d) => {
                assert!(d.published.local_commit_published.is_some())
            }
            s => panic!("expected closing, got {:?}", s.name()),
        }
    }

    #[test]
    fn timed_out_htlc_forces_close() {
        let (mut a, mut b) = establish_channel(0, false);
        let (_r, hash) = make_payment(8);
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(20_000_000, hash, FUNDING_HEIGHT + 4, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);

        a.process(ChannelEvent::BlockCount(FUNDING_HEIGHT + 3));
        assert_eq!(a.state_name(), StateName::Normal);
        a.process(ChannelEvent::BlockCount(FUNDING_HEIGHT + 4));
        assert_eq!(a.state_name(), StateName::Closing);
    }

    #[test]
    fn sign_with_nothing_pending_is_ignored() {
        let (mut a, _b) = establish_channel(0, false);
        let actions = a.process(ChannelEvent::Command(ChannelCommand::Sign));
        assert!(actions.is_empty());
        assert_eq!(commitments_of(&a).local_commit.index, 0);
    }

    #[test]
    fn concurrent_adds_complete_via_re_sign() {
        let (mut a, mut b) = establish_channel(0, false);
        let (_r1, h1) = make_payment(11);
        let (_r2, h2) = make_payment(12);

        // two adds, each requesting an immediate commit; the second sign
        // lands while the first round is in flight
        let mut actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(30_000_000, h1, FUNDING_HEIGHT + 10, true),
        )));
        actions.extend(a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(40_000_000, h2, FUNDING_HEIGHT + 11, true),
        ))));
        route(&mut a, &mut b, actions, vec![]);

        let ca = commitments_of(&a);
        let cb = commitments_of(&b);
        assert_eq!(ca.local_commit.spec.htlcs.len(), 2);
        assert_eq!(cb.local_commit.spec.htlcs.len(), 2);
        assert!(!ca.local_has_changes());
        assert!(!cb.local_has_changes());
        assert!(!ca.remote_next_commit_info.is_waiting());
        assert!(!cb.remote_next_commit_info.is_waiting());
        assert_conserved(ca);
        assert_conserved(cb);
    }

    #[test]
    fn fulfill_with_wrong_preimage_is_rejected() {
        let (mut a, mut b) = establish_channel(0, false);
        let (_r, hash) = make_payment(13);
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(20_000_000, hash, FUNDING_HEIGHT + 10, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);

        let (wrong, _h) = make_payment(14);
        let actions = b.process(ChannelEvent::Command(ChannelCommand::FulfillHtlc(
            CmdFulfillHtlc { id: 0, payment_preimage: wrong, commit: false },
        )));
        assert!(matches!(&actions[..], [Action::Reply(CommandResponse::Rejected(_))]));
        assert_eq!(b.state_name(), StateName::Normal);
    }

    #[test]
    fn htlc_ids_increase_across_settlements() {
        let (mut a, mut b) = establish_channel(0, false);
        for i in 0..3u8 {
            let (preimage, hash) = make_payment(30 + i);
            let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
                make_add_cmd(10_000_000, hash, FUNDING_HEIGHT + 20, false),
            )));
            route(&mut a, &mut b, add_actions, vec![]);
            sign_round(&mut a, &mut b);
            let fulfill_actions = b.process(ChannelEvent::Command(ChannelCommand::FulfillHtlc(
                CmdFulfillHtlc { id: i as u64, payment_preimage: preimage, commit: true },
            )));
            route(&mut a, &mut b, vec![], fulfill_actions);
        }
        assert_eq!(commitments_of(&a).local_next_htlc_id, 3);
        assert_eq!(commitments_of(&b).remote_next_htlc_id, 3);
        assert!(commitments_of(&a).has_no_pending_htlcs());
    }
}
