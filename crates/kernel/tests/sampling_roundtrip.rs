//! Sampling round-trip: drawing k samples leaves the store order untouched
//! and returns exactly k positions, all taken from the store.

use particle_kernel::{ParticleStore, SampleSelector, SphParticle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_store(rng: &mut StdRng, n: usize) -> ParticleStore<SphParticle, 3> {
    let mut store = ParticleStore::create(n);
    for i in 0..n {
        let pos = [rng.random(), rng.random(), rng.random()];
        store.push(SphParticle::new(i as u64, pos, 1.0));
    }
    store
}

#[test]
fn order_preserved_for_every_k() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut store = random_store(&mut rng, 257);
    let checksum = store.position_checksum();
    let mut selector = SampleSelector::new(12345, 0);

    for k in [0, 1, 2, 17, 128, 256, 257] {
        let samples = selector.draw(&mut store, k);
        assert_eq!(samples.len(), k);
        assert_eq!(store.position_checksum(), checksum, "k = {k}");
        for s in &samples {
            assert!(store.iter().any(|p| p.pos == *s));
        }
    }
}

#[test]
fn full_draw_is_a_permutation() {
    let mut rng = StdRng::seed_from_u64(8);
    let mut store = random_store(&mut rng, 64);
    let mut samples = SampleSelector::new(1, 1).draw(&mut store, 64);
    let mut positions: Vec<[f64; 3]> = store.iter().map(|p| p.pos).collect();

    let key = |a: &[f64; 3], b: &[f64; 3]| a[0].total_cmp(&b[0]);
    samples.sort_by(key);
    positions.sort_by(key);
    assert_eq!(samples, positions);
}
