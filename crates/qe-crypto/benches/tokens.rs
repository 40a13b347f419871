use qe_crypto::{
    derive_contention_token, encode_placeholder, EncryptionContext, EncryptionPlaceholder,
    Existence, KeyMaterial, MemoryKeyVault,
};
use uuid::Uuid;

fn make_value(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [8, 256, 4096])]
fn bench_existence_tag(bencher: divan::Bencher, size: usize) {
    let key = KeyMaterial::generate();
    let value = make_value(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            derive_contention_token::<Existence>(
                divan::black_box(&key),
                divan::black_box(&value),
                0,
            )
            .and_then(|token| token.tag())
            .unwrap()
        });
}

#[divan::bench]
fn bench_row_ids(bencher: divan::Bencher) {
    let key = KeyMaterial::generate();
    let tag = derive_contention_token::<Existence>(&key, b"\x02secret", 0)
        .and_then(|token| token.tag())
        .unwrap();
    bencher.bench(|| {
        for position in 1..=64u64 {
            divan::black_box(tag.row_id(divan::black_box(position)).unwrap());
        }
    });
}

#[divan::bench]
fn bench_encode_placeholder(bencher: divan::Bencher) {
    let index_key = Uuid::new_v4();
    let user_key = Uuid::new_v4();
    let mut vault = MemoryKeyVault::new();
    vault.insert(index_key, KeyMaterial::generate());
    vault.insert(user_key, KeyMaterial::generate());
    let placeholder = EncryptionPlaceholder::insert(index_key, user_key, "top secret", 8);
    let mut ctx = EncryptionContext::new(123456);
    bencher.bench_local(|| {
        encode_placeholder(divan::black_box(&placeholder), &vault, &mut ctx).unwrap()
    });
}

fn main() {
    divan::main();
}
