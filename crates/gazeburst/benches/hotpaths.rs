use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{GrayImage, Luma};

use gazeburst::{BurstConfig, BurstSearch, DiskTemplate, Ellipse, Rect};

fn draw_disk(w: u32, h: u32, cx: f32, cy: f32, r: f32, disk: u8, bg: u8) -> GrayImage {
    let mut img = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let pix = if dx * dx + dy * dy <= r * r { disk } else { bg };
            img.put_pixel(x, y, Luma([pix]));
        }
    }
    img
}

fn bench_burst(c: &mut Criterion) {
    let img = draw_disk(320, 240, 160.0, 120.0, 14.0, 20, 180);
    let region = Rect::new(100, 60, 120, 120);
    let cfg = BurstConfig::default();

    c.bench_function("burst_tracking_pass", |b| {
        // Warm state: discovery done once, each iteration is a tracking pass.
        let mut search = BurstSearch::new();
        search.process(&img, region, Some([158.0, 122.0]), &cfg);
        b.iter(|| {
            let outcome = search.process(black_box(&img), region, None, &cfg);
            black_box(outcome)
        })
    });

    c.bench_function("burst_discovery", |b| {
        b.iter(|| {
            let mut search = BurstSearch::new();
            let outcome = search.process(black_box(&img), region, Some([158.0, 122.0]), &cfg);
            black_box(outcome)
        })
    });
}

fn bench_template(c: &mut Criterion) {
    let img = draw_disk(320, 240, 160.0, 120.0, 3.0, 250, 30);
    let template = DiskTemplate::new(11, 3);
    c.bench_function("template_match_error", |b| {
        b.iter(|| black_box(template.match_error(black_box(&img), 160, 120)))
    });
}

fn bench_ellipse_fit(c: &mut Criterion) {
    let e = Ellipse {
        cx: 100.0,
        cy: 80.0,
        a: 14.0,
        b: 11.0,
        angle: 0.4,
    };
    let points = e.sample_points(32);
    c.bench_function("fit_ellipse_32pts", |b| {
        b.iter(|| black_box(gazeburst::fit_ellipse(black_box(&points))))
    });
}

criterion_group!(benches, bench_burst, bench_template, bench_ellipse_fit);
criterion_main!(benches);
