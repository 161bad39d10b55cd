//! Shared synthetic-image helpers for unit tests.

use image::{GrayImage, Luma};

use crate::cluster::Cluster;

/// Render a filled disk on a uniform background.
pub(crate) fn draw_disk_image(
    w: u32,
    h: u32,
    center: [f32; 2],
    radius: f32,
    disk_pix: u8,
    bg_pix: u8,
) -> GrayImage {
    let mut img = GrayImage::new(w, h);
    let r_sq = radius * radius;
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - center[0];
            let dy = y as f32 - center[1];
            let pix = if dx * dx + dy * dy <= r_sq {
                disk_pix
            } else {
                bg_pix
            };
            img.put_pixel(x, y, Luma([pix]));
        }
    }
    img
}

/// Render a dark-pupil eye: background 180, pupil disk 20, glint dots 250.
pub(crate) fn draw_eye_image(
    w: u32,
    h: u32,
    pupil_center: [f32; 2],
    pupil_radius: f32,
    glints: &[[f32; 2]],
) -> GrayImage {
    let mut img = draw_disk_image(w, h, pupil_center, pupil_radius, 20, 180);
    for g in glints {
        let r_sq = 2.0f32 * 2.0;
        for y in 0..h {
            for x in 0..w {
                let dx = x as f32 - g[0];
                let dy = y as f32 - g[1];
                if dx * dx + dy * dy <= r_sq {
                    img.put_pixel(x, y, Luma([250]));
                }
            }
        }
    }
    img
}

/// A closed contour cluster of `n` points on a circle.
pub(crate) fn circle_cluster(center: [f32; 2], radius: f32, n: usize) -> Cluster {
    let points = (0..n)
        .map(|i| {
            let t = std::f32::consts::TAU * i as f32 / n as f32;
            [
                (center[0] + radius * t.cos()).round() as i32,
                (center[1] + radius * t.sin()).round() as i32,
            ]
        })
        .collect();
    Cluster { points }
}
