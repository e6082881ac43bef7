use criterion::{criterion_group, criterion_main, Criterion};
use display_coordinator::config::CoordinatorConfig;
use display_coordinator::coordinator::Coordinator;
use display_coordinator::display::DisplayInfo;
use display_coordinator::engine::{BufferUsage, CollectionToken, HeadlessAllocator, HeadlessEngine};
use display_coordinator::fence::FenceNotifier;
use display_coordinator::session::{Reply, Request};
use display_coordinator::types::{
    BufferCollectionId, ClientKind, DisplayId, DisplayMode, ImageMetadata, ImageTiling, PixelFormat,
};
use std::sync::Arc;
use tokio::sync::mpsc;

fn bench_apply_vsync_cycle(c: &mut Criterion) {
    let engine = Arc::new(HeadlessEngine::new(false));
    let notifier: FenceNotifier = Arc::new(|_, _| {});
    let mut coordinator = Coordinator::new(
        engine.clone(),
        Arc::new(HeadlessAllocator::new()),
        &CoordinatorConfig::default(),
        notifier,
    );
    let display = DisplayId(1);
    coordinator.on_displays_changed(
        vec![DisplayInfo {
            id: display,
            modes: vec![DisplayMode { width: 1920, height: 1080, refresh_rate_millihertz: 60_000 }],
            pixel_formats: vec![PixelFormat::Argb8888],
            cursor_formats: vec![],
        }],
        vec![],
    );

    let (events, _rx) = mpsc::unbounded_channel();
    let client = coordinator.connect(ClientKind::Primary, events).expect("connect");
    let mut call = |request| coordinator.handle_request(client, request).expect("request");

    let collection_id = BufferCollectionId(1);
    let metadata = ImageMetadata::new(1920, 1080, PixelFormat::Argb8888);
    call(Request::ImportBufferCollection { collection_id, token: CollectionToken(1) });
    call(Request::SetBufferCollectionConstraints {
        collection_id,
        usage: BufferUsage { tiling: ImageTiling::Linear, min_buffer_count: 2 },
    });
    let images: Vec<_> = (0..2)
        .map(|index| match call(Request::ImportImage { collection_id, metadata, index }) {
            Reply::Image(id) => id,
            other => panic!("unexpected reply {:?}", other),
        })
        .collect();
    let layer_id = match call(Request::CreateLayer) {
        Reply::Layer(id) => id,
        other => panic!("unexpected reply {:?}", other),
    };
    call(Request::SetLayerPrimaryConfig { layer_id, metadata });
    call(Request::SetDisplayLayers { display_id: display, layer_ids: vec![layer_id] });

    let mut frame = 0usize;
    c.bench_function("apply_vsync_cycle", |b| {
        b.iter(|| {
            let image_id = images[frame % images.len()];
            frame += 1;
            coordinator
                .handle_request(client, Request::SetLayerImage { layer_id, image_id, wait_event: None })
                .expect("set image");
            coordinator.handle_request(client, Request::ApplyConfig).expect("apply");
            coordinator.on_display_vsync(display, frame as u64, engine.last_applied_stamp());
        })
    });
}

criterion_group!(benches, bench_apply_vsync_cycle);
criterion_main!(benches);
