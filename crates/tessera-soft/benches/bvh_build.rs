use criterion::{black_box, criterion_group, criterion_main, Criterion};
use glam::Vec3;
use tessera_soft::bvh::intersect_triangle;
use tessera_soft::{Aabb, Bvh};

/// Two triangles per cell of an `n` by `n` height field.
fn grid(n: usize, phase: f32) -> Vec<[Vec3; 3]> {
    let height = |x: usize, z: usize| ((x as f32 * 0.3 + phase).sin() + (z as f32 * 0.2).cos()) * 0.5;
    let point = |x: usize, z: usize| Vec3::new(x as f32, height(x, z), z as f32);
    let mut triangles = Vec::with_capacity(n * n * 2);
    for z in 0..n {
        for x in 0..n {
            let (a, b, c, d) = (point(x, z), point(x + 1, z), point(x + 1, z + 1), point(x, z + 1));
            triangles.push([a, b, c]);
            triangles.push([a, c, d]);
        }
    }
    triangles
}

fn bounds(triangles: &[[Vec3; 3]]) -> Vec<Aabb> {
    triangles.iter().map(|t| Aabb::from_points(t)).collect()
}

fn bvh_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("bvh");

    for n in [16, 64] {
        let boxes = bounds(&grid(n, 0.0));
        group.bench_function(format!("build_{}_triangles", n * n * 2), |b| {
            b.iter(|| Bvh::build(black_box(&boxes)))
        });
    }

    let moved = bounds(&grid(64, 1.0));
    let mut bvh = Bvh::build(&bounds(&grid(64, 0.0)));
    group.bench_function("refit_8192_triangles", |b| {
        b.iter(|| bvh.refit(black_box(&moved)))
    });

    let triangles = grid(64, 0.0);
    let bvh = Bvh::build(&bounds(&triangles));
    let origin = Vec3::new(31.5, 10.0, 31.5);
    group.bench_function("closest_hit", |b| {
        b.iter(|| {
            bvh.closest(black_box(origin), Vec3::NEG_Y, 0.0, f32::INFINITY, |index, t_max| {
                let hit = intersect_triangle(origin, Vec3::NEG_Y, &triangles[index as usize], 0.0, t_max)?;
                Some((hit.t, index))
            })
        })
    });

    group.finish();
}

criterion_group!(benches, bvh_benchmark);
criterion_main!(benches);
