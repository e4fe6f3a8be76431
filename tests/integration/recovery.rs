use crate::fault::*;
use crate::*;

use strand_core::meta::ThreadMeta;
use strand_core::SampleClass;
use strand_services::PipelineState;

// ══════════════════════════════════════════════════════════════════════════════
//  Recovery: parity, retransmission and meta retries under loss
// ══════════════════════════════════════════════════════════════════════════════

/// Data segment 1 of every sample is never answered. Each sample is still
/// rebuilt from the other two data segments and its parity segment.
#[tokio::test(start_paused = true)]
async fn test_parity_rebuilds_missing_segment() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 20, 0);
    let _drop = drop_matching(&net, data_segment_of("hd", 1));
    let producer = LiveProducer::start(
        &net,
        namespace(StreamType::Video, "cam"),
        vec![ThreadSpec::video("hd", 0x11)],
    )?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    stream.start("hd")?;
    wait_for_condition(Duration::from_secs(5), || sink.count() >= 20).await?;
    stream.stop();

    let rendered = sink.rendered();
    assert!(rendered.iter().all(|r| r.intact), "rebuilt payload differs");
    assert!(rendered.iter().all(|r| r.rebuilt == 1));
    assert!(strictly_increasing(&sink.playback_numbers()));

    let stats = stream.statistics();
    assert_eq!(stats.samples_recovered as usize, rendered.len());
    assert_eq!(stats.samples_unrecoverable, 0);
    assert!(stats.samples_verified as usize >= rendered.len(), "rebuilt without a manifest check");
    assert_eq!(stats.segments_rejected, 0);
    Ok(())
}

/// Data segment 1 of every sample is never answered and segment 0 comes
/// back with a forged payload under genuine headers. Rebuilding would need
/// the forged bytes, so the manifest check throws segment 0 out and no
/// sample reaches the sink.
#[tokio::test(start_paused = true)]
async fn test_tampered_segment_fails_manifest_check() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 20, 0);
    let _drop = drop_matching(&net, data_segment_of("hd", 1));
    let _tamper = tamper_matching(&net, data_segment_of("hd", 0));
    let producer = LiveProducer::start(
        &net,
        namespace(StreamType::Video, "cam"),
        vec![ThreadSpec::video("hd", 0x12)],
    )?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    stream.start("hd")?;
    wait_for_condition(Duration::from_secs(5), || stream.statistics().samples_corrupted >= 3).await?;
    stream.stop();

    assert_eq!(sink.count(), 0, "a sample with a forged segment was played");

    let stats = stream.statistics();
    assert!(stats.segments_rejected >= stats.samples_corrupted);
    assert_eq!(stats.samples_verified, 0);
    assert_eq!(stats.samples_recovered, 0);
    Ok(())
}

/// One audio bundle is never answered. It is requested at most once plus
/// the retry budget, never played, and playout carries on past it.
#[tokio::test(start_paused = true)]
async fn test_unanswered_sample_is_retried_within_budget() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 20, 0);
    let ns = namespace(StreamType::Audio, "mic");
    let producer = LiveProducer::start(&net, ns.clone(), vec![ThreadSpec::audio("pcm", 0x0A)])?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    stream.fetch_meta().await?;
    let bundle = match stream.thread_meta("pcm") {
        Some(ThreadMeta::Audio(m)) => m.bundle_no,
        other => bail!("unexpected thread meta {other:?}"),
    };

    let target = bundle + 25;
    let name = ns.segment("pcm", SampleClass::Delta, target, 0);
    let _drop = {
        let name = name.clone();
        drop_matching(&net, move |n| *n == name)
    };

    stream.start("pcm")?;
    wait_for_condition(Duration::from_secs(5), || {
        sink.playback_numbers().iter().any(|p| *p > target + 10)
    })
    .await?;
    // let every retry run out
    tokio::time::sleep(Duration::from_secs(3)).await;
    stream.stop();

    let budget = StrandConfig::default().fetch.max_retries + 1;
    let requests = net.requests_for(&name);
    assert!((1..=budget).contains(&requests), "requested {requests} times");
    assert!(!sink.playback_numbers().contains(&target));
    assert!(strictly_increasing(&sink.playback_numbers()));
    assert!(stream.statistics().retransmissions >= u64::from(requests - 1));
    Ok(())
}

/// Random loss and jitter: retransmissions and parity keep playout going
/// and nothing reaches the sink damaged or out of order.
#[tokio::test(start_paused = true)]
async fn test_playout_survives_packet_loss() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 25, 10);
    let _loss = add_packet_loss(&net, 15, 0x5eed);
    let producer = LiveProducer::start(
        &net,
        namespace(StreamType::Video, "cam"),
        vec![ThreadSpec::video("hd", 0x22)],
    )?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    stream.start("hd")?;
    wait_for_condition(Duration::from_secs(8), || sink.count() >= 30).await?;
    stream.stop();

    assert!(sink.rendered().iter().all(|r| r.intact));
    assert!(strictly_increasing(&sink.playback_numbers()));

    let stats = stream.statistics();
    assert!(stats.retransmissions > 0);
    assert!(stats.samples_recovered > 0);
    assert!(stats.requests_sent > stats.segments_received);
    Ok(())
}

/// Every answer comes from a cache: nothing counts as original, and the
/// stream still plays.
#[tokio::test(start_paused = true)]
async fn test_cached_answers_are_counted_apart() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 10, 0);
    let _cache = serve_from_cache(&net);
    let producer = LiveProducer::start(
        &net,
        namespace(StreamType::Video, "cam"),
        vec![ThreadSpec::video("hd", 0x33)],
    )?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    stream.start("hd")?;
    wait_for_condition(Duration::from_secs(5), || sink.count() >= 15).await?;
    stream.stop();

    let stats = stream.statistics();
    assert!(stats.segments_cached > 0);
    assert_eq!(stats.segments_original, 0);
    assert!(sink.rendered().iter().all(|r| r.intact));
    Ok(())
}

/// The first two thread meta requests go unanswered. Bootstrap keeps
/// asking, one request at a time, and fetching starts once meta arrives.
#[tokio::test(start_paused = true)]
async fn test_bootstrap_retries_thread_meta() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 20, 0);
    let ns = namespace(StreamType::Video, "cam");
    let meta_prefix = ns.thread_meta_prefix("hd");
    let _flaky = {
        let prefix = meta_prefix.clone();
        drop_first(&net, 2, move |n| *n == prefix)
    };
    let producer = LiveProducer::start(&net, ns, vec![ThreadSpec::video("hd", 0x44)])?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    let started = tokio::time::Instant::now();
    stream.start("hd")?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(stream.statistics().state, PipelineState::Bootstrap);
    assert_eq!(sink.count(), 0);
    assert_eq!(net.requests_for(&meta_prefix), 1, "one meta request in flight at a time");

    wait_for_condition(Duration::from_secs(10), || sink.count() >= 5).await?;
    stream.stop();

    assert_eq!(net.requests_for(&meta_prefix), 3);
    let first = sink.rendered()[0].at;
    assert!(first - started >= Duration::from_secs(4), "played before meta arrived");
    Ok(())
}
