#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::channel::{Channel, StateName};
    use crate::events::{
        BitcoinEventTag, BlockchainRequest, ChannelEvent, InitFundee, MakeFundingTxResponse,
        RouterMessage, WatchEvent,
    };
    use crate::funding::short_channel_id;
    use crate::util::test_utils::*;
    use crate::wire::Message;

    #[test]
    fn happy_open_state_trace() {
        let mut a = Channel::new(make_node_params(1));
        let mut b = Channel::new(make_node_params(2));
        assert_eq!(a.state_name(), StateName::WaitForInitInternal);
        assert_eq!(b.state_name(), StateName::WaitForInitInternal);

        let a_actions =
            a.process(ChannelEvent::InitFunder(make_init_funder(2, FUNDING_SAT, 0)));
        assert_eq!(a.state_name(), StateName::WaitForAcceptChannel);
        let open = match &sent_messages(&a_actions)[..] {
            [Message::OpenChannel(open)] => open.clone(),
            other => panic!("expected open_channel, got {:?}", other),
        };

        let b_actions = b.process(ChannelEvent::InitFundee(InitFundee {
            remote_node_id: make_node_params(1).node_id,
            local_params: make_local_params(20, false),
        }));
        assert!(b_actions.is_empty());
        assert_eq!(b.state_name(), StateName::WaitForOpenChannel);

        let b_actions = b.process(ChannelEvent::Message(Message::OpenChannel(open)));
        assert_eq!(b.state_name(), StateName::WaitForFundingCreated);
        let accept = match &sent_messages(&b_actions)[..] {
            [Message::AcceptChannel(accept)] => accept.clone(),
            other => panic!("expected accept_channel, got {:?}", other),
        };

        let a_actions = a.process(ChannelEvent::Message(Message::AcceptChannel(accept)));
        assert_eq!(a.state_name(), StateName::WaitForFundingInternal);
        let (script, amount) = match &blockchain_requests(&a_actions)[..] {
            [BlockchainRequest::MakeFundingTx { script_pubkey, amount_sat, .. }] => {
                (script_pubkey.clone(), *amount_sat)
            }
            other => panic!("expected funding tx request, got {:?}", other),
        };
        assert_eq!(amount, FUNDING_SAT);

        let funding_tx = make_funding_tx(script, amount);
        let a_actions = a.process(ChannelEvent::MakeFundingTxResponse(MakeFundingTxResponse {
            funding_tx,
            output_index: 0,
        }));
        assert_eq!(a.state_name(), StateName::WaitForFundingSigned);
        let funding_created = match &sent_messages(&a_actions)[..] {
            [Message::FundingCreated(m)] => m.clone(),
            other => panic!("expected funding_created, got {:?}", other),
        };

        let b_actions =
            b.process(ChannelEvent::Message(Message::FundingCreated(funding_created)));
        assert_eq!(b.state_name(), StateName::WaitForFundingConfirmed);
        let funding_signed = match &sent_messages(&b_actions)[..] {
            [Message::FundingSigned(m)] => m.clone(),
            other => panic!("expected funding_signed, got {:?}", other),
        };
        // the fundee watches the funding output without publishing
        assert!(blockchain_requests(&b_actions)
            .iter()
            .any(|r| matches!(r, BlockchainRequest::WatchConfirmed { .. })));
        assert!(!blockchain_requests(&b_actions)
            .iter()
            .any(|r| matches!(r, BlockchainRequest::PublishAsap(_))));

        let a_actions = a.process(ChannelEvent::Message(Message::FundingSigned(funding_signed)));
        assert_eq!(a.state_name(), StateName::WaitForFundingConfirmed);
        assert!(blockchain_requests(&a_actions)
            .iter()
            .any(|r| matches!(r, BlockchainRequest::PublishAsap(_))));

        let confirmed = ChannelEvent::Watch(WatchEvent::Confirmed {
            tag: BitcoinEventTag::FundingDepthOk,
            block_height: FUNDING_HEIGHT,
            tx_index: FUNDING_TX_INDEX,
        });
        let a_actions = a.process(confirmed.clone());
        assert_eq!(a.state_name(), StateName::WaitForFundingLocked);
        let a_locked = match sent_messages(&a_actions)
            .into_iter()
            .find(|m| matches!(m, Message::FundingLocked(_)))
        {
            Some(m) => m,
            None => panic!("expected funding_locked"),
        };
        assert!(blockchain_requests(&a_actions)
            .iter()
            .any(|r| matches!(r, BlockchainRequest::WatchLost { .. })));

        // early funding_locked is deferred by the unconfirmed side
        let b_actions = b.process(ChannelEvent::Message(a_locked));
        assert!(b_actions.is_empty());
        assert_eq!(b.state_name(), StateName::WaitForFundingConfirmed);

        // once confirmed, the deferred message is replayed and the fundee
        // goes straight to NORMAL
        let b_actions = b.process(confirmed);
        assert_eq!(b.state_name(), StateName::Normal);
        let b_locked = sent_messages(&b_actions)
            .into_iter()
            .find(|m| matches!(m, Message::FundingLocked(_)))
            .expect("fundee funding_locked");

        a.process(ChannelEvent::Message(b_locked));
        assert_eq!(a.state_name(), StateName::Normal);

        let expected_id = short_channel_id(FUNDING_HEIGHT, FUNDING_TX_INDEX, 0);
        assert_eq!(commitments_of(&a).channel_id, expected_id);
        assert_eq!(commitments_of(&b).channel_id, expected_id);
    }

    #[test]
    fn establish_helper_reaches_normal() {
        let (a, b) = establish_channel(0, false);
        assert_eq!(a.state_name(), StateName::Normal);
        assert_eq!(b.state_name(), StateName::Normal);
        assert_eq!(commitments_of(&a).local_commit.index, 0);
        assert_eq!(commitments_of(&b).local_commit.index, 0);
        assert_eq!(
            commitments_of(&a).local_commit.spec.to_local_msat,
            FUNDING_SAT * 1000
        );
        assert_eq!(commitments_of(&b).local_commit.spec.to_local_msat, 0);
    }

    #[test]
    fn push_msat_credits_fundee() {
        let (a, b) = establish_channel(200_000_000, false);
        assert_eq!(
            commitments_of(&a).local_commit.spec.to_local_msat,
            FUNDING_SAT * 1000 - 200_000_000
        );
        assert_eq!(commitments_of(&b).local_commit.spec.to_local_msat, 200_000_000);
    }

    #[test]
    fn open_with_reserve_above_funding_is_rejected() {
        let mut a = Channel::new(make_node_params(1));
        let mut b = Channel::new(make_node_params(2));
        let a_actions = a.process(ChannelEvent::InitFunder(make_init_funder(2, FUNDING_SAT, 0)));
        b.process(ChannelEvent::InitFundee(InitFundee {
            remote_node_id: make_node_params(1).node_id,
            local_params: make_local_params(20, false),
        }));
        let mut open = match sent_messages(&a_actions).remove(0) {
            Message::OpenChannel(open) => open,
            other => panic!("expected open_channel, got {:?}", other),
        };
        open.channel_reserve_satoshis = open.funding_satoshis + 1;

        let b_actions = b.process(ChannelEvent::Message(Message::OpenChannel(open)));
        assert_eq!(b.state_name(), StateName::Closed);
        assert!(sent_messages(&b_actions).iter().any(|m| matches!(m, Message::Error(_))));
    }

    #[test]
    fn announced_channel_publishes_after_tick() {
        let (mut a, b) = establish_channel(0, true);
        assert_eq!(a.state_name(), StateName::Normal);
        assert_eq!(b.state_name(), StateName::Normal);

        let actions = a.process(ChannelEvent::AnnouncementsTick);
        let router: Vec<&RouterMessage> = actions
            .iter()
            .filter_map(|a| match a {
                crate::events::Action::Router(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(router.len(), 3);
        assert!(router.iter().any(|r| matches!(r, RouterMessage::ChannelAnnouncement(_))));
        assert!(router.iter().any(|r| matches!(r, RouterMessage::NodeAnnouncement(_))));
        assert!(router.iter().any(|r| matches!(r, RouterMessage::ChannelUpdate(_))));
    }
}
