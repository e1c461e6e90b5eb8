use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaChaRng;
use rust_decimal::Decimal;
use teller::bank::Bank;

const USERS: usize = 16;

#[derive(Clone, Copy)]
enum Op {
    Deposit(usize, Decimal),
    Withdraw(usize, Decimal),
    Send(usize, usize, Decimal),
}

fn user(index: usize) -> String {
    format!("user{index}")
}

fn amount(rng: &mut ChaChaRng) -> Decimal {
    Decimal::new((rng.next_u32() % 10_000) as i64 + 1, 2)
}

fn gen_inputs(size: usize) -> Vec<Op> {
    let mut rng = ChaChaRng::from_seed([0; 32]);
    let mut res = Vec::new();
    for _ in 0..size {
        let a = rng.next_u32() as usize % USERS;
        let b = (a + 1 + rng.next_u32() as usize % (USERS - 1)) % USERS;
        let op = match rng.next_u32() % 4 {
            0..=1 => Op::Deposit(a, amount(&mut rng)),
            2 => Op::Withdraw(a, amount(&mut rng)),
            3 => Op::Send(a, b, amount(&mut rng)),
            _ => unreachable!(),
        };
        res.push(op);
    }
    res
}

fn run(bank: &Bank, ops: &[Op], callers: usize) {
    let chunk = ops.len().div_ceil(callers);
    std::thread::scope(|scope| {
        for ops in ops.chunks(chunk) {
            let bank = bank.clone();
            scope.spawn(move || {
                for op in ops {
                    // rejections and empty balances are part of the workload
                    let _ = match *op {
                        Op::Deposit(a, value) => bank.deposit(&user(a), value, "usd").map(|_| ()),
                        Op::Withdraw(a, value) => bank.withdraw(&user(a), value, "usd").map(|_| ()),
                        Op::Send(a, b, value) => {
                            bank.send(&user(a), &user(b), value, "usd").map(|_| ())
                        }
                    };
                }
            });
        }
    });
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Bank");
    let input_size = [1_000, 10_000];
    for i in input_size.iter() {
        for workers in [1, 2, 4] {
            group.bench_with_input(BenchmarkId::new(format!("{workers} workers"), i), i, |b, i| {
                let input = gen_inputs(*i);
                b.iter(|| {
                    let bank = Bank::new(workers).unwrap();
                    for index in 0..USERS {
                        bank.create_user(&user(index)).unwrap();
                    }
                    run(&bank, &input, 4)
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
