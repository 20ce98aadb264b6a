// Paging Property Tests
//
// Random user access sequences from several processes run against a tiny
// frame pool. Every page must keep its data, and after every step no page
// may be both mapped and swapped.

use std::collections::BTreeMap;
use std::vec::Vec;

use proptest::prelude::*;
use x86_64::VirtAddr;

use crate::config::{page_round_down, PAGE_SIZE};
use crate::mm::addrspace::ProcessId;
use crate::mm::pagedir::PageDirectory;
use crate::mm::spt::Residency;
use crate::mm::testkit::{MemFile, Machine, STACK_TOP};

const STACK_PAGES: u64 = 6;
const MAP_BASE: u64 = 0x1000_0000;
const MAP_PAGES: u64 = 3;

#[derive(Debug, Clone, Copy)]
struct Op {
    process: u64,
    page: u64,
    write: Option<u8>,
}

fn arb_op() -> impl Strategy<Value = Op> {
    (0u64..2, 0u64..STACK_PAGES + MAP_PAGES, proptest::option::of(any::<u8>()))
        .prop_map(|(process, page, write)| Op { process, page, write })
}

fn address(page: u64) -> u64 {
    if page < STACK_PAGES {
        STACK_TOP - (page + 1) * PAGE_SIZE as u64 + 8
    } else {
        MAP_BASE + (page - STACK_PAGES) * PAGE_SIZE as u64 + 8
    }
}

fn assert_exclusive(m: &Machine, pids: &[ProcessId]) {
    m.vm.audit().unwrap();
    for &pid in pids {
        for page in 0..STACK_PAGES + MAP_PAGES {
            let Some(info) = m.vm.page_info(pid, VirtAddr::new(address(page))) else {
                continue;
            };
            let upage = page_round_down(VirtAddr::new(address(page)));
            let mapped = m.dir(pid).lookup_physical(upage).is_some();
            match info.residency {
                Residency::Swapped(_) | Residency::Unloaded => assert!(!mapped),
                Residency::Resident(_) => assert!(mapped),
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn pages_are_never_mapped_and_swapped(ops in proptest::collection::vec(arb_op(), 1..80)) {
        let m = Machine::new(3, 32);
        let file = MemFile::with_contents(&[0xAB; MAP_PAGES as usize * PAGE_SIZE]);
        let pids: Vec<ProcessId> = (1..=2).map(|raw| m.spawn(raw)).collect();
        for &pid in &pids {
            m.set_esp(pid, STACK_TOP - STACK_PAGES * PAGE_SIZE as u64);
            m.vm.mmap(pid, &file.handle(), MAP_BASE).unwrap();
        }

        let mut model: BTreeMap<(u64, u64), u8> = BTreeMap::new();
        for op in ops {
            let pid = pids[op.process as usize];
            let addr = address(op.page);
            let initial = if op.page < STACK_PAGES { 0 } else { 0xAB };
            let expected = *model.get(&(op.process, op.page)).unwrap_or(&initial);

            prop_assert_eq!(m.read(pid, addr), Ok(expected));
            if let Some(value) = op.write {
                m.write(pid, addr, value).unwrap();
                model.insert((op.process, op.page), value);
            }
            assert_exclusive(&m, &pids);
        }

        for pid in pids {
            m.vm.release_all(pid);
        }
        prop_assert_eq!(m.pool.get_stats(), (3, 3));
        prop_assert_eq!(m.swap.free_slots(), 32);
    }
}
