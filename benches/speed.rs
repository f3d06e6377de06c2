//! A throughput benchmark for sequential write and read against a
//! RAM-backed flash simulator.

extern crate criterion;

use criterion::{criterion_group, BatchSize, BenchmarkId, Criterion, Throughput};

use serialfs::flash::FlashBus;
use serialfs::layout::open_flags;
use serialfs::mount::{Clock, Config, FormatMode, Mount, SupplyMonitor};
use serialfs::FileDescriptor;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Armed {
    None,
    ReadId,
    ReadStatus,
    ReadData(u32),
}

struct RamBus {
    mem: Vec<u8>,
    opcode: Option<u8>,
    armed: Armed,
    pending_page_addr: Option<u32>,
    status_reg: u8,
}

fn be24(buf: &[u8]) -> u32 {
    ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32
}

impl RamBus {
    fn new(size: usize) -> Self {
        RamBus { mem: vec![0xFFu8; size], opcode: None, armed: Armed::None, pending_page_addr: None, status_reg: 0 }
    }
}

impl FlashBus for RamBus {
    type Error = core::convert::Infallible;

    fn spi_init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
    fn spi_close(&mut self) {}

    fn select(&mut self) {
        self.opcode = None;
        self.armed = Armed::None;
    }
    fn deselect(&mut self) {}

    fn spi_read(&mut self, buf: &mut [u8]) {
        match self.armed {
            Armed::ReadId => {
                buf[0] = 0xC2;
                buf[1] = 0x28;
                buf[2] = 0x13;
            }
            Armed::ReadStatus => buf[0] = self.status_reg,
            Armed::ReadData(addr) => {
                let addr = addr as usize;
                buf.copy_from_slice(&self.mem[addr..addr + buf.len()]);
            }
            Armed::None => panic!("spi_read with no command armed"),
        }
    }

    fn spi_write(&mut self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        if let Some(addr) = self.pending_page_addr.take() {
            let addr = addr as usize;
            for (i, &b) in buf.iter().enumerate() {
                self.mem[addr + i] &= b;
            }
            self.status_reg &= !0x02;
            return;
        }
        if let Some(0x20) = self.opcode {
            let addr = be24(buf) as usize;
            self.mem[addr..addr + 4096].fill(0xFF);
            self.status_reg &= !0x02;
            self.opcode = None;
            return;
        }
        let opcode = buf[0];
        self.opcode = Some(opcode);
        match opcode {
            0x9F => self.armed = Armed::ReadId,
            0x05 => self.armed = Armed::ReadStatus,
            0x06 => self.status_reg |= 0x02,
            0xB9 | 0xAB => {}
            0x03 => self.armed = Armed::ReadData(be24(&buf[1..4])),
            0x02 => self.pending_page_addr = Some(be24(&buf[1..4])),
            0x20 => {}
            0xC7 => {
                self.mem.fill(0xFF);
                self.status_reg &= !0x02;
            }
            other => panic!("unrecognised opcode {other:#04x}"),
        }
    }

    fn wait_usec(&mut self, _usec: u32) {}
}

struct FixedClock;
impl Clock for FixedClock {
    fn now_unix(&mut self) -> u32 {
        1_700_000_000
    }
}

struct AlwaysOk;
impl SupplyMonitor for AlwaysOk {
    fn is_ok(&mut self) -> bool {
        true
    }
}

fn mounted(size: usize) -> Mount<RamBus, FixedClock, AlwaysOk> {
    let mut mount = Mount::new(RamBus::new(size), FixedClock, AlwaysOk, Config::default());
    mount.format(FormatMode::Soft).unwrap();
    mount
}

const SIZES: &[usize] = &[1024, 64 * 1024, 512 * 1024];

fn bench_write_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential write");

    for &len in SIZES {
        let data = vec![0x5Au8; len];
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::new("write+close", len), &data, |b, data| {
            b.iter_batched(
                || mounted(2 * 1024 * 1024),
                |mut mount| {
                    let mut desc = FileDescriptor::new();
                    mount.open(&mut desc, b"bench", open_flags::CREATE | open_flags::WRITE).unwrap();
                    mount.write(&mut desc, data).unwrap();
                    mount.close(&mut desc).unwrap();
                },
                BatchSize::LargeInput,
            )
        });
    }
}

fn bench_read_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential read");

    for &len in SIZES {
        let data = vec![0x5Au8; len];
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_with_input(BenchmarkId::new("read", len), &data, |b, data| {
            b.iter_batched(
                || {
                    let mut mount = mounted(2 * 1024 * 1024);
                    let mut desc = FileDescriptor::new();
                    mount.open(&mut desc, b"bench", open_flags::CREATE | open_flags::WRITE).unwrap();
                    mount.write(&mut desc, data).unwrap();
                    mount.close(&mut desc).unwrap();
                    mount.open(&mut desc, b"bench", open_flags::READ).unwrap();
                    (mount, desc)
                },
                |(mut mount, mut desc)| {
                    let mut buf = vec![0u8; data.len()];
                    mount.read(&mut desc, Some(&mut buf), data.len() as u32).unwrap();
                },
                BatchSize::LargeInput,
            )
        });
    }
}

criterion_group!(benches, bench_write_speed, bench_read_speed);

fn main() {
    std::thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .spawn(|| {
            benches();
            Criterion::default().configure_from_args().final_summary();
        })
        .unwrap()
        .join()
        .unwrap();
}
