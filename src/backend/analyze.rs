use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::emu::Emulator;

fn print_header(category: &str) {
    println!();
    println!("  -------------------------");
    println!("  {}", category);
    println!("  -------------------------");
}

fn print_time(label: &str, ns: i64) {
    let threshold = 1000000.0;
    let us = ns as f64 / 1000.0;
    if us < threshold {
        println!("          {}: {:.3} us", label, us);
    } else {
        println!("          {}: {:.3e} us", label, us);
    }
}

fn print_model_statistics(emulator: &Emulator) {
    print_header("Model Statistics");
    let emu = emulator.emu();
    let total: u64 = emu.nevents_by_model().values().sum();
    for (tag, count) in emu.nevents_by_model() {
        let name = emulator
            .models()
            .specs()
            .iter()
            .find(|spec| spec.tag == *tag)
            .map_or("(unknown)", |spec| spec.name);
        println!();
        println!("      Model '{}' {}", *tag as char, name);
        println!("          Events: {}", count);
        println!("          Share: {:.2}%", 100.0 * *count as f64 / total as f64);
    }
}

fn print_stream_statistics(emulator: &Emulator) {
    print_header("Stream Statistics");
    // Busiest streams first
    let mut ordering = BTreeMap::<Reverse<u64>, Vec<usize>>::new();
    for (i, stream) in emulator.emu().player.streams().iter().enumerate() {
        ordering
            .entry(Reverse(stream.nevents()))
            .or_default()
            .push(i);
    }
    for (Reverse(nevents), streams) in ordering {
        for i in streams {
            let stream = emulator.emu().player.stream(i);
            println!();
            println!("      Stream {}", stream.relpath());
            println!("          Events: {}", nevents);
            println!("          Progress: {:.2}%", 100.0 * stream.progress());
            if stream.clock_offset() != 0 {
                println!("          Clock offset: {} ns", stream.clock_offset());
            }
        }
    }
}

fn print_clock_statistics(emulator: &Emulator) {
    print_header("Clock Statistics");
    let player = &emulator.emu().player;
    println!();
    match player.first_clock() {
        Some(first) => {
            println!("          First clock: {} ns", first);
            println!("          Last clock: {} ns", player.last_clock());
            print_time("Duration", player.elapsed().0);
        }
        None => println!("          No events"),
    }
    println!("          Events processed: {}", player.nprocessed());
}

pub fn analyze_statistics(emulator: &Emulator) {
    print_model_statistics(emulator);
    print_stream_statistics(emulator);
    print_clock_statistics(emulator);
}
