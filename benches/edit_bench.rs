//! Benchmarks for buffer operations matching real editor usage patterns
//!
//! - sequential typing (the fast append path)
//! - random inserts and deletes (tree splits and rebalancing)
//! - line content scans (order-statistics descent plus line cache)
//! - offset/position conversions

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use piece_tree::PieceTreeBuffer;

/// Generate a realistic document with mixed content
fn generate_document(lines: usize) -> String {
    let mut doc = String::new();
    for i in 0..lines {
        match i % 5 {
            0 => doc.push_str(&format!("fn function_{}() {{\n", i)),
            1 => doc.push_str(&format!(
                "    let variable_{} = \"string literal with some text\";\n",
                i
            )),
            2 => doc.push_str(&format!("    // Comment explaining line {}\n", i)),
            3 => doc.push_str(&format!("    process_data({}, {}, {});\n", i, i * 2, i * 3)),
            _ => doc.push_str("}\n"),
        }
    }
    doc
}

struct XorShift(u64);

impl XorShift {
    fn below(&mut self, bound: usize) -> usize {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x % bound.max(1) as u64) as usize
    }
}

fn bench_sequential_typing(c: &mut Criterion) {
    c.bench_function("sequential_typing_4k", |b| {
        b.iter(|| {
            let mut buffer = PieceTreeBuffer::from_str("");
            for i in 0..4096 {
                buffer.insert(i, "x").unwrap();
            }
            std::hint::black_box(buffer.len());
        });
    });
}

fn bench_random_edits(c: &mut Criterion) {
    let mut group = c.benchmark_group("random_edits");
    for size in [100, 1000, 10000].iter() {
        let text = generate_document(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut buffer = PieceTreeBuffer::from_str(&text);
                let mut rng = XorShift(0x1234_5678_9ABC_DEF0);
                for _ in 0..256 {
                    let offset = rng.below(buffer.len());
                    if rng.below(4) == 0 && buffer.len() > 8 {
                        buffer.delete(offset.min(buffer.len() - 1), 1).unwrap();
                    } else {
                        buffer.insert(offset, "word\n").unwrap();
                    }
                }
                std::hint::black_box(buffer.len());
            });
        });
    }
    group.finish();
}

fn bench_line_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_scan");
    for size in [1000, 10000].iter() {
        let text = generate_document(*size);
        let buffer = PieceTreeBuffer::from_str(&text);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut total = 0usize;
                for line in 1..=buffer.line_count() {
                    total += buffer.get_line_content(line).len();
                }
                std::hint::black_box(total);
            });
        });
    }
    group.finish();
}

fn bench_position_conversion(c: &mut Criterion) {
    let text = generate_document(10_000);
    let buffer = PieceTreeBuffer::from_str(&text);
    c.bench_function("offset_position_round_trip", |b| {
        let mut rng = XorShift(0xDEAD_BEEF_CAFE_F00D);
        b.iter(|| {
            let offset = rng.below(buffer.len() + 1);
            let pos = buffer.get_position_at(offset);
            std::hint::black_box(buffer.get_offset_at(pos.line_number, pos.column));
        });
    });
}

criterion_group!(
    benches,
    bench_sequential_typing,
    bench_random_edits,
    bench_line_scan,
    bench_position_conversion
);
criterion_main!(benches);
