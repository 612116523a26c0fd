#[cfg(test)]
mod tests {
    use bitcoin::secp256k1::{Message as SecpMessage, Secp256k1};
    use test_log::test;

    use crate::channel::{ChannelState, StateName};
    use crate::closing::next_closing_fee;
    use crate::events::{
        Action, BitcoinEventTag, ChannelCommand, ChannelEvent, CmdClose, CmdFulfillHtlc,
        CommandResponse, WatchEvent,
    };
    use crate::util::test_utils::*;
    use crate::wire::{CommitSig, Message};

    fn closing_data(channel: &crate::channel::Channel) -> &crate::channel::DataClosing {
        match channel.state() {
            ChannelState::Closing(d) => d,
            s => panic!("expected closing, got {:?}", s.name()),
        }
    }

    #[test]
    fn mutual_close_without_htlcs() {
        let (mut a, mut b) = establish_channel(0, false);
        let actions = a.process(ChannelEvent::Command(ChannelCommand::Close(CmdClose {
            script_pubkey: None,
        })));
        assert!(actions
            .iter()
            .any(|act| matches!(act, Action::Reply(CommandResponse::Ok))));
        let (a_out, b_out) = route(&mut a, &mut b, actions, vec![]);

        assert_eq!(a.state_name(), StateName::Closing);
        assert_eq!(b.state_name(), StateName::Closing);
        assert!(closing_data(&a).published.mutual_close_published.is_some());
        assert!(closing_data(&b).published.mutual_close_published.is_some());

        // same fee formula on both sides, so agreement in one round each
        let a_rounds =
            sent_messages(&a_out).iter().filter(|m| matches!(m, Message::ClosingSigned(_))).count();
        let b_rounds =
            sent_messages(&b_out).iter().filter(|m| matches!(m, Message::ClosingSigned(_))).count();
        assert!(a_rounds <= 3 && b_rounds <= 3);

        // both publish the same transaction
        let tx_a = closing_data(&a).published.mutual_close_published.clone().unwrap();
        let tx_b = closing_data(&b).published.mutual_close_published.clone().unwrap();
        assert_eq!(tx_a.txid(), tx_b.txid());

        a.process(ChannelEvent::Watch(WatchEvent::Confirmed {
            tag: BitcoinEventTag::CloseDone,
            block_height: FUNDING_HEIGHT + 10,
            tx_index: 1,
        }));
        assert_eq!(a.state_name(), StateName::Closed);
    }

    #[test]
    fn fee_negotiation_converges_by_midpoint() {
        // L3: iterated midpoint agreement terminates quickly
        let (mut fee_a, mut fee_b) = (1_000u64, 9_000u64);
        let mut rounds = 0;
        let agreed = loop {
            rounds += 1;
            assert!(rounds < 20, "negotiation did not converge");
            // a receives b's proposal
            if fee_b == fee_a {
                break fee_b;
            }
            let next = next_closing_fee(fee_a, fee_b);
            if next == fee_b {
                break fee_b;
            }
            fee_a = next;
            // b receives a's proposal
            if fee_a == fee_b {
                break fee_a;
            }
            let next = next_closing_fee(fee_b, fee_a);
            if next == fee_a {
                break fee_a;
            }
            fee_b = next;
        };
        assert!(agreed >= 1_000 && agreed <= 9_000);
        assert!(rounds <= 13);
    }

    #[test]
    fn invalid_commit_sig_publishes_local_commit() {
        let (mut a, mut b) = establish_channel(0, false);
        let (_r, hash) = make_payment(21);
        // an unsigned add gives B pending changes to sign for
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(25_000_000, hash, FUNDING_HEIGHT + 8, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);

        let secp_ctx = Secp256k1::new();
        let bogus = secp_ctx.sign_ecdsa(
            &SecpMessage::from_slice(&[42u8; 32]).unwrap(),
            &make_test_privkey(99),
        );
        let actions = b.process(ChannelEvent::Message(Message::CommitSig(CommitSig {
            channel_id: commitments_of(&b).channel_id,
            signature: bogus,
            htlc_signatures: vec![],
        })));

        assert_eq!(b.state_name(), StateName::Closing);
        assert!(sent_messages(&actions).iter().any(|m| matches!(m, Message::Error(_))));
        assert!(closing_data(&b).published.local_commit_published.is_some());
        let lcp = closing_data(&b).published.local_commit_published.as_ref().unwrap();
        assert!(lcp.commit_tx.is_some());
    }

    #[test]
    fn revoked_commit_is_punished() {
        // S5: the peer publishes an old commitment; we penalize it
        let (mut a, mut b) = establish_channel(200_000_000, false);
        let (_r1, h1) = make_payment(31);

        // round 1: an HTLC lands in commitment 1
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(50_000_000, h1, FUNDING_HEIGHT + 30, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);
        let revoked_commit = commitments_of(&b).local_commit.publishable_txs.commit_tx.clone();
        assert_eq!(commitments_of(&b).local_commit.index, 1);

        // round 2: another HTLC advances both chains, revoking commitment 1
        let (_r2, h2) = make_payment(32);
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(40_000_000, h2, FUNDING_HEIGHT + 31, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);
        assert_eq!(commitments_of(&a).remote_commit.index, 2);

        // B cheats with commitment 1
        let actions = a.process(ChannelEvent::Watch(WatchEvent::Spent {
            tag: BitcoinEventTag::FundingSpent,
            tx: revoked_commit,
        }));
        assert_eq!(a.state_name(), StateName::Closing);
        let published = &closing_data(&a).published;
        assert_eq!(published.revoked_commit_published.len(), 1);
        let rvk = &published.revoked_commit_published[0];
        assert!(rvk.main_penalty_tx.is_some(), "peer main output must be punished");
        assert!(!rvk.htlc_penalty_txs.is_empty(), "htlc output must be punished");
        assert!(blockchain_requests(&actions)
            .iter()
            .any(|r| matches!(r, crate::events::BlockchainRequest::WatchConfirmed {
                tag: BitcoinEventTag::PenaltyDone,
                ..
            })));

        a.process(ChannelEvent::Watch(WatchEvent::Confirmed {
            tag: BitcoinEventTag::PenaltyDone,
            block_height: FUNDING_HEIGHT + 40,
            tx_index: 2,
        }));
        assert_eq!(a.state_name(), StateName::Closed);
    }

    #[test]
    fn revoked_commit_with_since_settled_htlc_is_punished() {
        // the cheating commitment carried an HTLC that was fulfilled and
        // dropped from both live specs long before the cheat
        let (mut a, mut b) = establish_channel(200_000_000, false);
        let (preimage, h1) = make_payment(33);

        // round 1: h1 lands in commitment 1
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(50_000_000, h1, FUNDING_HEIGHT + 30, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);
        let revoked_commit = commitments_of(&b).local_commit.publishable_txs.commit_tx.clone();
        let htlc_outputs_on_revoked = revoked_commit
            .output
            .iter()
            .filter(|o| o.value == 50_000)
            .count();
        assert_eq!(htlc_outputs_on_revoked, 1);

        // round 2: h1 settles, vanishing from both live specs
        let fulfill_actions = b.process(ChannelEvent::Command(ChannelCommand::FulfillHtlc(
            CmdFulfillHtlc { id: 0, payment_preimage: preimage, commit: true },
        )));
        route(&mut a, &mut b, vec![], fulfill_actions);

        // round 3: unrelated traffic advances the chains further
        let (_r2, h2) = make_payment(34);
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(40_000_000, h2, FUNDING_HEIGHT + 35, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);
        assert!(commitments_of(&a).remote_commit.index >= 3);
        assert!(commitments_of(&a)
            .local_commit
            .spec
            .htlcs
            .iter()
            .all(|h| h.add.payment_hash != h1));

        // B cheats with the long-revoked commitment 1
        let actions = a.process(ChannelEvent::Watch(WatchEvent::Spent {
            tag: BitcoinEventTag::FundingSpent,
            tx: revoked_commit,
        }));
        assert_eq!(a.state_name(), StateName::Closing);
        let published = &closing_data(&a).published;
        assert_eq!(published.revoked_commit_published.len(), 1);
        let rvk = &published.revoked_commit_published[0];
        assert!(rvk.main_penalty_tx.is_some());
        assert_eq!(
            rvk.htlc_penalty_txs.len(),
            htlc_outputs_on_revoked,
            "every htlc output on the revoked tx must be punished"
        );
        assert!(blockchain_requests(&actions)
            .iter()
            .any(|r| matches!(r, crate::events::BlockchainRequest::PublishAsap(_))));
    }

    #[test]
    fn remote_commit_publish_is_claimed() {
        let (mut a, mut b) = establish_channel(0, false);
        let (preimage, hash) = make_payment(41);
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(60_000_000, hash, FUNDING_HEIGHT + 20, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);
        let fulfill_actions = b.process(ChannelEvent::Command(ChannelCommand::FulfillHtlc(
            CmdFulfillHtlc { id: 0, payment_preimage: preimage, commit: true },
        )));
        route(&mut a, &mut b, vec![], fulfill_actions);

        // B force-closes with its (current) commitment
        let b_commit = commitments_of(&b).local_commit.publishable_txs.commit_tx.clone();
        a.process(ChannelEvent::Watch(WatchEvent::Spent {
            tag: BitcoinEventTag::FundingSpent,
            tx: b_commit,
        }));
        assert_eq!(a.state_name(), StateName::Closing);
        let published = &closing_data(&a).published;
        let rcp = published.remote_commit_published.as_ref().expect("remote commit recognized");
        assert!(rcp.claim_main_output_tx.is_some(), "our main output is directly spendable");

        a.process(ChannelEvent::Watch(WatchEvent::Confirmed {
            tag: BitcoinEventTag::RemoteCommitDone,
            block_height: FUNDING_HEIGHT + 50,
            tx_index: 3,
        }));
        assert_eq!(a.state_name(), StateName::Closed);
    }

    #[test]
    fn shutdown_defers_close_until_htlcs_settle() {
        let (mut a, mut b) = establish_channel(0, false);
        let (preimage, hash) = make_payment(51);
        let add_actions = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(
            make_add_cmd(30_000_000, hash, FUNDING_HEIGHT + 20, false),
        )));
        route(&mut a, &mut b, add_actions, vec![]);
        sign_round(&mut a, &mut b);

        // closing with an HTLC in flight parks both sides in SHUTDOWN
        let actions = b.process(ChannelEvent::Command(ChannelCommand::Close(CmdClose {
            script_pubkey: None,
        })));
        route(&mut a, &mut b, vec![], actions);
        assert_eq!(a.state_name(), StateName::Shutdown);
        assert_eq!(b.state_name(), StateName::Shutdown);

        // new HTLCs are refused during shutdown
        let (_r, h2) = make_payment(52);
        let refused = a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(make_add_cmd(
            10_000_000,
            h2,
            FUNDING_HEIGHT + 25,
            false,
        ))));
        assert!(matches!(&refused[..], [Action::Reply(CommandResponse::Rejected(_))]));

        // settling the HTLC lets the close proceed to negotiation and out
        let fulfill_actions = b.process(ChannelEvent::Command(ChannelCommand::FulfillHtlc(
            CmdFulfillHtlc { id: 0, payment_preimage: preimage, commit: true },
        )));
        route(&mut a, &mut b, vec![], fulfill_actions);
        assert_eq!(a.state_name(), StateName::Closing);
        assert_eq!(b.state_name(), StateName::Closing);
        assert!(closing_data(&a).published.mutual_close_published.is_some());
    }

    #[test]
    fn close_with_pending_changes_is_rejected() {
        let (mut a, mut _b) = establish_channel(0, false);
        let (_r, hash) = make_payment(61);
        a.process(ChannelEvent::Command(ChannelCommand::AddHtlc(make_add_cmd(
            10_000_000,
            hash,
            FUNDING_HEIGHT + 20,
            false,
        ))));
        let actions = a.process(ChannelEvent::Command(ChannelCommand::Close(CmdClose {
            script_pubkey: None,
        })));
        assert!(matches!(&actions[..], [Action::Reply(CommandResponse::Rejected(_))]));
        assert_eq!(a.state_name(), StateName::Normal);
    }

    #[test]
    fn unrecognized_funding_spend_is_an_information_leak() {
        let (mut a, _b) = establish_channel(0, false);
        // a spend that is neither a commitment we know nor decodable as a
        // revoked one
        let rogue = make_funding_tx(make_final_script(90), 999_000);
        let actions = a.process(ChannelEvent::Watch(WatchEvent::Spent {
            tag: BitcoinEventTag::FundingSpent,
            tx: rogue,
        }));
        assert_eq!(a.state_name(), StateName::ErrInformationLeak);
        // our own commitment goes on-chain on the way out
        assert!(blockchain_requests(&actions)
            .iter()
            .any(|r| matches!(r, crate::events::BlockchainRequest::PublishAsap(_))));
    }

    #[test]
    fn peer_error_publishes_local_commit() {
        let (mut a, _b) = establish_channel(0, false);
        let channel_id = commitments_of(&a).channel_id;
        a.process(ChannelEvent::Message(Message::Error(crate::wire::ErrorMessage {
            channel_id,
            data: "boom".into(),
        })));
        assert_eq!(a.state_name(), StateName::Closing);
        assert!(closing_data(&a).published.local_commit_published.is_some());
    }
}
