use sneed::{Env, RwTxn};
use tempfile::TempDir;

use super::*;

fn addr(n: u8) -> Address {
    Address::parse(&format!("0x{:040x}", n)).unwrap()
}

fn creator() -> Address {
    addr(0xc0)
}

fn setup() -> (TempDir, Env, State) {
    let dir = tempfile::tempdir().unwrap();
    let env = {
        let mut env_open_opts = heed::EnvOpenOptions::new();
        env_open_opts
            .map_size(64 * 1024 * 1024)
            .max_dbs(State::NUM_DBS);
        unsafe { Env::open(&env_open_opts, dir.path()) }.unwrap()
    };
    let state = State::new(&env).unwrap();
    (dir, env, state)
}

fn commit<T>(
    env: &Env,
    f: impl FnOnce(&mut RwTxn) -> Result<T, Error>,
) -> Result<T, Error> {
    let mut rwtxn = env.write_txn()?;
    let value = f(&mut rwtxn)?;
    rwtxn.commit()?;
    Ok(value)
}

fn create(
    env: &Env,
    state: &State,
    builder: CompetitionBuilder,
    now: u64,
) -> Competition {
    let nonce = uuid::Uuid::new_v4();
    let competition = builder.build(now, nonce.as_bytes()).unwrap();
    commit(env, |rwtxn| state.create_competition(rwtxn, competition, now))
        .unwrap()
        .competition
}

fn wager(max: Option<u32>) -> CompetitionBuilder {
    let builder =
        CompetitionBuilder::new("derby".into(), creator(), Category::Wager)
            .with_timeline(0, 1_000);
    match max {
        Some(max) => builder.with_max_participants(max),
        None => builder,
    }
}

fn prediction() -> CompetitionBuilder {
    CompetitionBuilder::new(
        "rain tomorrow".into(),
        creator(),
        Category::Prediction,
    )
    .with_timeline(0, 1_000)
    .with_market(100.0, 0.5)
}

fn join_request(participant: Address) -> JoinRequest {
    JoinRequest {
        participant,
        position: "yes".to_owned(),
        stake: 10.0,
    }
}

fn bet_request(n: u8, outcome: Outcome, amount: f64) -> BetRequest {
    BetRequest {
        bettor: addr(n),
        outcome,
        amount,
        bet_id: None,
    }
}

#[test]
fn concurrent_joins_never_exceed_cap() {
    let (_dir, env, state) = setup();
    let competition = create(&env, &state, wager(Some(3)), 10);
    let id = competition.id;

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (1..=10u8)
            .map(|n| {
                let (env, state) = (&env, &state);
                scope.spawn(move || {
                    commit(env, |rwtxn| {
                        state.join(rwtxn, id, join_request(addr(n)), 20)
                    })
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let successes = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(successes, 3);
    for result in &results {
        if let Err(err) = result {
            assert_eq!(err.code(), "FULL");
        }
    }
    let mut counts: Vec<u32> = results
        .iter()
        .filter_map(|result| result.as_ref().ok())
        .map(|applied| applied.value.total_participants)
        .collect();
    counts.sort();
    assert_eq!(counts, vec![1, 2, 3]);

    let rotxn = env.read_txn().unwrap();
    let stored = state.get_competition(&rotxn, id).unwrap();
    assert_eq!(stored.participants.len(), 3);
    assert_eq!(stored.prize_pool.total, 30.0);
}

#[test]
fn concurrent_joins_from_one_address_succeed_once() {
    let (_dir, env, state) = setup();
    let id = create(&env, &state, wager(None), 10).id;
    let spellings = [
        "0x8BA1F109551BD432803012645AC136DDD64DBA72",
        "0x8ba1f109551bd432803012645ac136ddd64dba72",
        "0x8Ba1f109551bD432803012645Ac136ddd64dBa72",
        "0X8BA1F109551BD432803012645AC136DDD64DBA72",
    ];

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = spellings
            .iter()
            .map(|raw| {
                let (env, state) = (&env, &state);
                let participant = Address::parse(raw).unwrap();
                scope.spawn(move || {
                    commit(env, |rwtxn| {
                        state.join(rwtxn, id, join_request(participant), 20)
                    })
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|result| matches!(result, Err(Error::AlreadyJoined { .. })))
            .count(),
        3
    );
}

#[test]
fn join_checks_run_in_order() {
    let (_dir, env, state) = setup();
    let missing = CompetitionId::new([9; 8]);
    let err = commit(&env, |rwtxn| {
        state.join(rwtxn, missing, join_request(addr(1)), 0)
    })
    .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let draft = create(&env, &state, wager(Some(1)).as_draft(), 10).id;
    let err = commit(&env, |rwtxn| {
        state.join(rwtxn, draft, join_request(addr(1)), 20)
    })
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");

    let capped = create(&env, &state, wager(Some(1)), 10).id;
    commit(&env, |rwtxn| state.join(rwtxn, capped, join_request(addr(1)), 20))
        .unwrap();
    // already present is reported before full
    let err = commit(&env, |rwtxn| {
        state.join(rwtxn, capped, join_request(addr(1)), 20)
    })
    .unwrap_err();
    assert_eq!(err.code(), "ALREADY_JOINED");
    let err = commit(&env, |rwtxn| {
        state.join(rwtxn, capped, join_request(addr(2)), 20)
    })
    .unwrap_err();
    assert_eq!(err.code(), "FULL");
}

#[test]
fn joining_adds_participant_judge_and_index_entry() {
    let (_dir, env, state) = setup();
    let builder = wager(None).with_judge(addr(1), JudgeRole::Arbiter, 3);
    let id = create(&env, &state, builder, 10).id;

    let applied = commit(&env, |rwtxn| {
        state.join(rwtxn, id, join_request(addr(1)), 20)
    })
    .unwrap();
    assert!(!applied.value.judge_added);
    let applied = commit(&env, |rwtxn| {
        state.join(rwtxn, id, join_request(addr(2)), 21)
    })
    .unwrap();
    assert!(applied.value.judge_added);

    let judges = &applied.competition.arbitration.judges;
    assert_eq!(judges.len(), 2);
    assert_eq!(judges[0].role, JudgeRole::Arbiter);
    assert_eq!(judges[1].role, JudgeRole::ParticipantJudge);

    let rotxn = env.read_txn().unwrap();
    let filter = CompetitionFilter {
        participant: Some(addr(2)),
        ..CompetitionFilter::default()
    };
    let listed = state.competitions().list_competitions(&rotxn, &filter).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}

#[test]
fn bet_moves_market_and_is_recorded() {
    let (_dir, env, state) = setup();
    let id = create(&env, &state, prediction(), 10).id;

    let applied = commit(&env, |rwtxn| {
        state.place_bet(rwtxn, id, bet_request(1, Outcome::Yes, 10.0), 20)
    })
    .unwrap();
    let placed = &applied.value;
    assert!(placed.new_probability > 0.5 && placed.new_probability < 1.0);
    assert_eq!(placed.bet.seq, 0);
    let market = applied.competition.market.as_ref().unwrap();
    assert!(market.pool.yes < 100.0);
    assert_eq!(market.volume, 10.0);
    assert_eq!(market.bet_count, 1);

    commit(&env, |rwtxn| {
        state.place_bet(rwtxn, id, bet_request(2, Outcome::No, 5.0), 21)
    })
    .unwrap();

    let rotxn = env.read_txn().unwrap();
    let competition = state.get_competition(&rotxn, id).unwrap();
    let bets = state.competitions().get_bets(&rotxn, &competition).unwrap();
    assert_eq!(bets.len(), 2);
    assert_eq!(bets[0].bettor, addr(1));
    assert_eq!(bets[1].outcome, Outcome::No);
    assert_eq!(bets[1].probability_before, bets[0].probability_after);
}

#[test]
fn bet_checks_run_in_order() {
    let (_dir, env, state) = setup();
    let bet = |id| {
        commit(&env, |rwtxn| {
            state.place_bet(rwtxn, id, bet_request(1, Outcome::Yes, 1.0), 20)
        })
        .unwrap_err()
        .code()
    };

    assert_eq!(bet(CompetitionId::new([7; 8])), "NOT_FOUND");
    let wager_id = create(&env, &state, wager(None), 10).id;
    assert_eq!(bet(wager_id), "NOT_PREDICTION");
    let bare = CompetitionBuilder::new("bare".into(), creator(), Category::Prediction)
        .with_timeline(0, 1_000);
    let bare_id = create(&env, &state, bare, 10).id;
    assert_eq!(bet(bare_id), "NO_MARKET");
    let future = prediction().with_timeline(500, 1_000);
    let future_id = create(&env, &state, future, 10).id;
    assert_eq!(bet(future_id), "INVALID_STATUS");

    let live = create(&env, &state, prediction(), 10).id;
    let err = commit(&env, |rwtxn| {
        state.place_bet(rwtxn, live, bet_request(1, Outcome::Yes, -2.0), 20)
    })
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_AMOUNT");
}

#[test]
fn idempotency_key_rejects_replayed_bets() {
    let (_dir, env, state) = setup();
    let id = create(&env, &state, prediction(), 10).id;
    let key = uuid::Uuid::new_v4();
    let request = BetRequest {
        bet_id: Some(key),
        ..bet_request(1, Outcome::Yes, 3.0)
    };
    let placed = commit(&env, |rwtxn| state.place_bet(rwtxn, id, request.clone(), 20))
        .unwrap();
    assert_eq!(placed.value.bet.id, key);
    let err = commit(&env, |rwtxn| state.place_bet(rwtxn, id, request, 21))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateBet { bet_id, .. } if bet_id == key));

    // without a key, identical bets are distinct trades
    commit(&env, |rwtxn| {
        state.place_bet(rwtxn, id, bet_request(1, Outcome::Yes, 3.0), 22)
    })
    .unwrap();
    commit(&env, |rwtxn| {
        state.place_bet(rwtxn, id, bet_request(1, Outcome::Yes, 3.0), 23)
    })
    .unwrap();
}

#[test]
fn draining_bet_is_refused_and_market_keeps_trading() {
    let (_dir, env, state) = setup();
    let id = create(&env, &state, prediction(), 10).id;

    let err = commit(&env, |rwtxn| {
        state.place_bet(rwtxn, id, bet_request(1, Outcome::Yes, 10_000.0), 20)
    })
    .unwrap_err();
    assert_eq!(err.code(), "LOW_LIQUIDITY");
    {
        let rotxn = env.read_txn().unwrap();
        let market = state.get_competition(&rotxn, id).unwrap().market.unwrap();
        assert_eq!(market.bet_count, 0);
        assert!(market.pool.is_liquid());
    }

    for (n, outcome) in [(2, Outcome::No), (3, Outcome::Yes)] {
        let applied = commit(&env, |rwtxn| {
            state.place_bet(rwtxn, id, bet_request(n, outcome, 50.0), 21)
        })
        .unwrap();
        let probability = applied.value.new_probability;
        assert!(probability > 0.0 && probability < 1.0);
    }

    let tiny = prediction().with_market(1.0, 0.5);
    let tiny_id = create(&env, &state, tiny, 10).id;
    let err = commit(&env, |rwtxn| {
        state.place_bet(rwtxn, tiny_id, bet_request(4, Outcome::Yes, 1e17), 20)
    })
    .unwrap_err();
    assert_eq!(err.code(), "LOW_LIQUIDITY");
}

#[test]
fn three_judges_resolve_once() {
    let (_dir, env, state) = setup();
    let builder = wager(None)
        .with_judge(addr(1), JudgeRole::Arbiter, 1)
        .with_judge(addr(2), JudgeRole::Arbiter, 1)
        .with_judge(addr(3), JudgeRole::Arbiter, 1);
    let id = create(&env, &state, builder, 10).id;
    let vote = |judge: u8, choice: &str, now: u64| {
        commit(&env, |rwtxn| {
            state.vote(rwtxn, id, addr(judge), choice.to_owned(), None, now)
        })
    };

    let first = vote(1, "approve", 20).unwrap().value;
    assert!(!first.resolution_reached);
    assert_eq!(first.progress.required_votes, 2);
    assert_eq!(first.progress.threshold_percent, 66);

    let err = vote(1, "reject", 21).unwrap_err();
    assert_eq!(err.code(), "ALREADY_VOTED");
    let err = vote(9, "approve", 21).unwrap_err();
    assert_eq!(err.code(), "NOT_JUDGE");

    let second = vote(2, "Approve", 22).unwrap();
    assert!(second.value.resolution_reached);
    assert_eq!(second.value.verdict, Some(Verdict::Approved));
    assert_eq!(second.competition.status, Status::Completed);
    assert_eq!(second.value.progress.approval_votes, 2);

    let err = vote(3, "reject", 23).unwrap_err();
    assert!(matches!(
        err,
        Error::AlreadyResolved {
            verdict: Verdict::Approved,
            ..
        }
    ));

    let rotxn = env.read_txn().unwrap();
    let progress = state.voting_progress(&rotxn, id).unwrap();
    assert_eq!(progress.explicit_votes, 2);
    assert_eq!(progress.rejection_votes, 0);
}

#[test]
fn tied_votes_end_disputed() {
    let (_dir, env, state) = setup();
    let builder = wager(None)
        .with_judge(addr(1), JudgeRole::Reviewer, 1)
        .with_judge(addr(2), JudgeRole::Reviewer, 1);
    let id = create(&env, &state, builder, 10).id;
    commit(&env, |rwtxn| {
        state.vote(rwtxn, id, addr(1), "approve".into(), None, 20)
    })
    .unwrap();
    let applied = commit(&env, |rwtxn| {
        state.vote(rwtxn, id, addr(2), "reject".into(), None, 21)
    })
    .unwrap();
    assert_eq!(applied.value.verdict, Some(Verdict::Disputed));
    assert_eq!(applied.competition.status, Status::Disputed);

    let err = commit(&env, |rwtxn| {
        state.vote(rwtxn, id, addr(1), "approve".into(), None, 22)
    })
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");
}

#[test]
fn timeline_transitions_are_applied_before_the_mutation() {
    let (_dir, env, state) = setup();
    let builder = wager(None).with_timeline(100, 200);
    let created = create(&env, &state, builder, 50);
    assert_eq!(created.status, Status::Pending);

    let applied = commit(&env, |rwtxn| {
        state.join(rwtxn, created.id, join_request(addr(1)), 150)
    })
    .unwrap();
    assert_eq!(applied.competition.status, Status::Active);
    let kinds: Vec<_> = applied.events.iter().map(|event| event.kind).collect();
    assert_eq!(kinds, vec![EventKind::StatusChanged, EventKind::ParticipantJoined]);

    // past the end the competition is resolving and no longer accepts joins
    let err = commit(&env, |rwtxn| {
        state.join(rwtxn, created.id, join_request(addr(2)), 250)
    })
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");

    let synced = commit(&env, |rwtxn| state.sync_due(rwtxn, 250)).unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].competition.status, Status::Resolving);
}

#[test]
fn market_price_resolution_follows_final_probability() {
    let (_dir, env, state) = setup();
    let builder = prediction()
        .with_timeline(0, 100)
        .with_resolution_mode(ResolutionMode::MarketPrice);
    let id = create(&env, &state, builder, 10).id;
    commit(&env, |rwtxn| {
        state.place_bet(rwtxn, id, bet_request(1, Outcome::Yes, 30.0), 20)
    })
    .unwrap();

    let synced = commit(&env, |rwtxn| state.sync_due(rwtxn, 150)).unwrap();
    let competition = &synced[0].competition;
    assert_eq!(competition.status, Status::Completed);
    assert_eq!(competition.arbitration.verdict, Some(Verdict::Approved));
    let kinds: Vec<_> = synced[0].events.iter().map(|event| event.kind).collect();
    assert_eq!(kinds, vec![EventKind::StatusChanged, EventKind::Resolved]);
}

#[test]
fn event_sequence_follows_mutation_order() {
    let (_dir, env, state) = setup();
    let id = create(&env, &state, wager(None), 10).id;
    let mut all = Vec::new();
    for n in 1..=4 {
        let applied = commit(&env, |rwtxn| {
            let applied = state.join(rwtxn, id, join_request(addr(n)), 20)?;
            state.write_events(rwtxn, &applied.events)?;
            Ok(applied)
        })
        .unwrap();
        all.extend(applied.events);
    }
    let seqs: Vec<u64> = all.iter().map(|event| event.seq).collect();
    // creation and immediate activation took seqs 0 and 1
    assert_eq!(seqs, vec![2, 3, 4, 5]);

    let rotxn = env.read_txn().unwrap();
    let recent = state.recent_events(&rotxn, id, 2).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].seq, 4);
    assert_eq!(recent[1].actor, addr(4));
    let competition = state.get_competition(&rotxn, id).unwrap();
    assert_eq!(competition.event_seq, 6);
    assert_eq!(competition.version, 5);
}

#[test]
fn only_the_creator_manages_the_lifecycle() {
    let (_dir, env, state) = setup();
    let id = create(&env, &state, wager(None).as_draft(), 10).id;
    let judge = Judge {
        address: addr(5),
        role: JudgeRole::Verifier,
        weight: 2,
        added_at: 0,
    };

    let err = commit(&env, |rwtxn| {
        state.register_judge(rwtxn, id, &addr(1), judge.clone(), 20)
    })
    .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
    commit(&env, |rwtxn| {
        state.register_judge(rwtxn, id, &creator(), judge.clone(), 20)
    })
    .unwrap();
    let err = commit(&env, |rwtxn| {
        state.register_judge(rwtxn, id, &creator(), judge.clone(), 21)
    })
    .unwrap_err();
    assert_eq!(err.code(), "JUDGE_EXISTS");

    let err = commit(&env, |rwtxn| {
        state.transition(rwtxn, id, &creator(), Status::Completed, 22)
    })
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
    let applied = commit(&env, |rwtxn| {
        state.transition(rwtxn, id, &creator(), Status::Pending, 22)
    })
    .unwrap();
    // the started timeline is only applied by the next mutation
    assert_eq!(applied.competition.status, Status::Pending);

    let err = commit(&env, |rwtxn| {
        state.cancel(rwtxn, id, &addr(1), String::new(), 23)
    })
    .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
    let applied = commit(&env, |rwtxn| {
        state.cancel(rwtxn, id, &creator(), "rain".into(), 23)
    })
    .unwrap();
    assert_eq!(applied.competition.status, Status::Cancelled);
    let err = commit(&env, |rwtxn| {
        state.cancel(rwtxn, id, &creator(), String::new(), 24)
    })
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");
}

#[test]
fn disputes_need_a_stakeholder_while_resolving() {
    let (_dir, env, state) = setup();
    let builder = wager(None).with_timeline(0, 100);
    let id = create(&env, &state, builder, 10).id;
    commit(&env, |rwtxn| state.join(rwtxn, id, join_request(addr(1)), 20))
        .unwrap();

    let err = commit(&env, |rwtxn| {
        state.dispute(rwtxn, id, &addr(1), String::new(), 50)
    })
    .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");
    let err = commit(&env, |rwtxn| {
        state.dispute(rwtxn, id, &addr(2), String::new(), 150)
    })
    .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
    // the creator is neither participant nor judge
    let err = commit(&env, |rwtxn| {
        state.dispute(rwtxn, id, &creator(), String::new(), 150)
    })
    .unwrap_err();
    assert_eq!(err.code(), "UNAUTHORIZED");
    let applied = commit(&env, |rwtxn| {
        state.dispute(rwtxn, id, &addr(1), "late start".into(), 150)
    })
    .unwrap();
    assert_eq!(applied.competition.status, Status::Disputed);
    assert_eq!(applied.competition.arbitration.verdict, Some(Verdict::Disputed));
}
