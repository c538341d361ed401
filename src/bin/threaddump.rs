//! Spawns a couple of worker threads and dumps every thread in the process.

#[cfg(target_os = "linux")]
fn main() {
    use std::sync::{Arc, RwLock};
    use std::thread::spawn;

    use stackshot::{current_thread, dump_stack, thread_iterator};

    let running = Arc::new(RwLock::new(true));
    let mut handles = Vec::new();

    let busy_flag = running.clone();
    handles.push(spawn(move || {
        while *busy_flag.read().expect("read lock") {
            let mut _sum = 0u64;
            for i in 1..10000 {
                _sum += i;
            }
        }
    }));

    let idle_flag = running.clone();
    handles.push(spawn(move || {
        while *idle_flag.read().expect("read lock") {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }));

    // Let both threads get going.
    std::thread::sleep(std::time::Duration::from_millis(100));

    let threads = thread_iterator().expect("threads");
    for result in threads {
        let thread = result.expect("thread");
        let label = if thread.is_current() { " (this thread)" } else { "" };
        println!("thread {:?}{}", thread, label);
        let lines = dump_stack(thread);
        if lines.is_empty() {
            println!("    <no frames>");
        }
        for line in lines {
            println!("    {}", line);
        }
        println!();
    }

    {
        let mut flag = running.write().expect("write lock");
        *flag = false;
    }
    for handle in handles {
        handle.join().expect("successful join");
    }

    println!("dumped from thread {:?}", current_thread());
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("thread capture is not supported on this platform");
}
