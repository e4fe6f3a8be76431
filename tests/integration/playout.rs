use crate::fault::*;
use crate::*;

use std::sync::atomic::{AtomicUsize, Ordering};

use strand_core::meta::ThreadMeta;
use strand_services::{AvSynchronizer, BufferObserver, PipelineState, StreamError, SyncRole};

// ══════════════════════════════════════════════════════════════════════════════
//  Playout: samples reach the sink whole, in order, at publish pace
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_video_plays_in_order_and_intact() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 20, 0);
    let producer = LiveProducer::start(
        &net,
        namespace(StreamType::Video, "cam"),
        vec![ThreadSpec::video("hd", 0xA1)],
    )?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    let meta = stream.fetch_meta().await?;
    assert_eq!(meta.threads, vec!["hd".to_string()]);

    stream.start("hd")?;
    wait_for_condition(Duration::from_secs(5), || sink.count() >= 40).await?;
    assert!(stream.stop());

    let rendered = sink.rendered();
    assert!(strictly_increasing(&sink.playback_numbers()), "{:?}", sink.playback_numbers());
    assert!(rendered.iter().all(|r| r.intact && r.tag == 0xA1 && r.thread == "hd"));

    // one sample per 40ms once playing
    let span = rendered[rendered.len() - 1].at - rendered[0].at;
    assert!(span >= Duration::from_millis(1500), "played too fast: {span:?}");

    let stats = stream.statistics();
    assert_eq!(stats.samples_played as usize, rendered.len());
    assert_eq!(stats.state, PipelineState::Stopped);
    assert!(stats.segments_original > 0);
    assert!(stats.drd_original_ms > 0.0);
    assert_eq!(stats.current_rate, 25.0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_audio_meta_then_playout() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 20, 0);
    let producer = LiveProducer::start(
        &net,
        namespace(StreamType::Audio, "mic"),
        vec![ThreadSpec::audio("pcm", 0x0A)],
    )?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    assert!(!stream.is_meta_fetched());
    stream.fetch_meta().await?;
    assert!(stream.is_meta_fetched());
    assert_eq!(stream.threads(), vec!["pcm".to_string()]);
    match stream.thread_meta("pcm") {
        Some(ThreadMeta::Audio(m)) => {
            assert_eq!(m.rate, 50.0);
            assert_eq!(m.codec, "opus");
        }
        other => bail!("unexpected thread meta {other:?}"),
    }

    assert!(matches!(stream.start("aac"), Err(StreamError::UnknownThread(_))));
    assert!(!stream.is_running());

    stream.start("pcm")?;
    wait_for_condition(Duration::from_secs(3), || sink.count() >= 50).await?;
    stream.stop();

    let numbers = sink.playback_numbers();
    assert!(strictly_increasing(&numbers));
    let gaps = numbers.windows(2).filter(|w| w[1] != w[0] + 1).count();
    assert!(gaps <= numbers.len() / 10, "{gaps} gaps in {numbers:?}");
    assert!(sink.rendered().iter().all(|r| r.intact));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_thread_switch_flushes_old_thread() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 15, 0);
    let producer = LiveProducer::start(
        &net,
        namespace(StreamType::Video, "cam"),
        vec![ThreadSpec::video("sd", 0x5D), ThreadSpec::video("hd", 0x4D)],
    )?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    stream.fetch_meta().await?;
    assert_eq!(stream.threads(), vec!["sd".to_string(), "hd".to_string()]);
    assert!(matches!(stream.thread_meta("hd"), Some(ThreadMeta::Video(_))));

    stream.start("sd")?;
    wait_for_condition(Duration::from_secs(3), || sink.count() >= 10).await?;

    assert!(stream.set_thread("hd")?);
    assert!(!stream.set_thread("hd")?, "already on hd");
    assert!(matches!(stream.set_thread("4k"), Err(StreamError::UnknownThread(_))));

    let hd_count = || sink.rendered().iter().filter(|r| r.thread == "hd").count();
    wait_for_condition(Duration::from_secs(4), || hd_count() >= 10).await?;
    stream.stop();

    let rendered = sink.rendered();
    let first_hd = rendered.iter().position(|r| r.thread == "hd").unwrap_or(rendered.len());
    assert!(first_hd > 0);
    assert!(rendered[..first_hd].iter().all(|r| r.thread == "sd"));
    assert!(rendered[first_hd..].iter().all(|r| r.thread == "hd"), "old thread played after the switch");
    assert!(rendered.iter().all(|r| r.intact && (r.tag == 0x5D) == (r.thread == "sd")));
    assert_eq!(stream.statistics().thread, "hd");
    Ok(())
}

#[derive(Default)]
struct Arrivals(AtomicUsize);

impl BufferObserver for Arrivals {
    fn on_sample_arrived(&self, _playback_no: u64) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_halts_requests_and_playout() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 20, 0);
    let producer = LiveProducer::start(
        &net,
        namespace(StreamType::Video, "cam"),
        vec![ThreadSpec::video("hd", 1)],
    )?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sink = Arc::new(CollectingSink::default());
    let stream = consumer(&net, &producer, &sink)?;
    let arrivals = Arc::new(Arrivals::default());
    let handle = stream.attach(&arrivals);

    stream.start("hd")?;
    wait_for_condition(Duration::from_secs(3), || sink.count() >= 10).await?;
    assert!(arrivals.0.load(Ordering::SeqCst) >= 10);
    assert_eq!(stream.statistics().state, PipelineState::Fetching);

    assert!(stream.stop());
    assert!(!stream.is_running());
    let sent = net.total_requests();
    let played = sink.count();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(net.total_requests(), sent, "requests issued after stop");
    assert_eq!(sink.count(), played, "samples played after stop");

    let stats = stream.statistics();
    assert_eq!(stats.outstanding, 0);
    assert_eq!(stats.segments_lost, 0, "stop must not report losses");
    assert_eq!(stream.statistics_json()["state"], "stopped");

    assert!(stream.detach(handle));
    assert!(!stream.detach(handle));

    // a stopped stream can start again
    stream.start("hd")?;
    let before = sink.count();
    wait_for_condition(Duration::from_secs(3), || sink.count() >= before + 5).await?;
    stream.stop();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_av_sync_keeps_both_streams_playing() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let _delay = add_delay(&net, 20, 0);
    let audio = LiveProducer::start(&net, namespace(StreamType::Audio, "mic"), vec![ThreadSpec::audio("pcm", 2)])?;
    let video = LiveProducer::start(&net, namespace(StreamType::Video, "cam"), vec![ThreadSpec::video("hd", 3)])?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sync = Arc::new(AvSynchronizer::new());
    let audio_sink = Arc::new(CollectingSink::default());
    let video_sink = Arc::new(CollectingSink::default());
    let audio_stream = consumer(&net, &audio, &audio_sink)?;
    let video_stream = consumer(&net, &video, &video_sink)?;
    audio_stream.set_av_sync(sync.clone(), SyncRole::Master);
    video_stream.set_av_sync(sync.clone(), SyncRole::Slave);

    audio_stream.start("pcm")?;
    video_stream.start("hd")?;
    wait_for_condition(Duration::from_secs(5), || {
        audio_sink.count() >= 50 && video_sink.count() >= 25
    })
    .await?;
    audio_stream.stop();
    video_stream.stop();

    assert!(strictly_increasing(&audio_sink.playback_numbers()));
    assert!(strictly_increasing(&video_sink.playback_numbers()));
    assert!(video_sink.rendered().iter().all(|r| r.intact));
    Ok(())
}
