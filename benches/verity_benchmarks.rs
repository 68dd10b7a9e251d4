//! Benchmarks for the hash-tree engine and superblock codec.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rsverity::core::{digest, hashtree, params::Params, superblock::Superblock};
use tempfile::NamedTempFile;

fn write_data_file(size: usize) -> NamedTempFile {
    let file = NamedTempFile::new().unwrap();
    std::fs::write(file.path(), vec![0x5au8; size]).unwrap();
    file
}

fn bench_digest(c: &mut Criterion) {
    let block = vec![0x42u8; 4096];
    let mut group = c.benchmark_group("digest_block");
    for algo in ["sha1", "sha256", "sha512"] {
        group.bench_with_input(BenchmarkId::from_parameter(algo), algo, |b, &algo| {
            let algorithm = digest::HashAlgorithm::from_name(algo).unwrap();
            b.iter(|| digest::digest(algorithm, &[black_box(block.as_slice())]));
        });
    }
    group.finish();
}

fn bench_superblock_round_trip(c: &mut Criterion) {
    let params = Params {
        hash_algorithm: "sha256".to_string(),
        data_block_size: 4096,
        hash_block_size: 4096,
        data_blocks: 1024,
        hash_type: 1,
        salt: vec![0xab; 32],
        hash_area_offset: 4096,
        uuid: None,
        no_superblock: false,
    };
    c.bench_function("superblock_build_and_serialize", |b| {
        b.iter(|| {
            let sb = Superblock::build(black_box(&params)).unwrap();
            black_box(sb.serialize());
        });
    });
}

fn bench_hashtree_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashtree_build");
    for data_blocks in [16u64, 256, 4096] {
        let size = (data_blocks * 4096) as usize;
        let data_file = write_data_file(size);
        let hash_file = NamedTempFile::new().unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(data_blocks),
            &data_blocks,
            |b, &data_blocks| {
                b.iter(|| {
                    let params = Params {
                        hash_algorithm: "sha256".to_string(),
                        data_block_size: 4096,
                        hash_block_size: 4096,
                        data_blocks,
                        hash_type: 1,
                        salt: Vec::new(),
                        hash_area_offset: 4096,
                        uuid: None,
                        no_superblock: true,
                    };
                    let data = rsverity::blockdev::open(data_file.path().to_str().unwrap(), true).unwrap();
                    let hash = rsverity::blockdev::create(hash_file.path().to_str().unwrap(), 0).unwrap();
                    black_box(hashtree::build(&params, data.as_ref(), hash.as_ref()).unwrap());
                });
            },
        );
    }
    group.finish();
}

fn bench_hashtree_verify(c: &mut Criterion) {
    let data_blocks = 256u64;
    let size = (data_blocks * 4096) as usize;
    let data_file = write_data_file(size);
    let hash_file = NamedTempFile::new().unwrap();

    let params = Params {
        hash_algorithm: "sha256".to_string(),
        data_block_size: 4096,
        hash_block_size: 4096,
        data_blocks,
        hash_type: 1,
        salt: Vec::new(),
        hash_area_offset: 4096,
        uuid: None,
        no_superblock: true,
    };

    let root_hash = {
        let data = rsverity::blockdev::open(data_file.path().to_str().unwrap(), true).unwrap();
        let hash = rsverity::blockdev::create(hash_file.path().to_str().unwrap(), 0).unwrap();
        hashtree::build(&params, data.as_ref(), hash.as_ref()).unwrap()
    };

    c.bench_function("hashtree_verify_256_blocks", |b| {
        b.iter(|| {
            let data = rsverity::blockdev::open(data_file.path().to_str().unwrap(), true).unwrap();
            let hash = rsverity::blockdev::open(hash_file.path().to_str().unwrap(), true).unwrap();
            hashtree::verify(
                black_box(&params),
                data.as_ref(),
                hash.as_ref(),
                black_box(&root_hash),
            )
            .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_digest,
    bench_superblock_round_trip,
    bench_hashtree_build,
    bench_hashtree_verify
);
criterion_main!(benches);
