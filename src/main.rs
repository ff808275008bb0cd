#![cfg_attr(target_arch = "riscv32", no_std)]
#![cfg_attr(target_arch = "riscv32", no_main)]

#[cfg(target_arch = "riscv32")]
mod firmware {
    use esp_hal::clock::CpuClock;
    use esp_hal::efuse::Efuse;
    use esp_hal::rng::Rng;
    use esp_hal::timer::timg::TimerGroup;
    use esp_println::println;

    // WiFi imports
    use esp_wifi::wifi;

    // Embassy-net imports
    use embassy_net::{Config, Stack, StackResources};
    use embassy_time::{Duration, Timer};
    use esp_hal_embassy::Executor;
    use static_cell::StaticCell;

    use fixture_rs::credentials::StaticCredentials;
    use fixture_rs::embassy_transport::{
        EmbassyTransport, FixtureSubsystem, NetLinks, SOCKET_SLOTS, controller_task, mdns_task,
        socket_task,
    };
    use fixture_rs::wifi::WifiSubsystem;

    // Add app descriptor for espflash compatibility
    esp_bootloader_esp_idf::esp_app_desc!();

    // Static cells for embassy components
    static WIFI_INIT_CELL: StaticCell<esp_wifi::EspWifiController<'static>> = StaticCell::new();
    static STACK_RESOURCES: StaticCell<StackResources<{ SOCKET_SLOTS + 2 }>> = StaticCell::new();
    static SUBSYSTEM_CELL: StaticCell<FixtureSubsystem> = StaticCell::new();
    static LINKS: NetLinks = NetLinks::new();

    // Static executor for embassy tasks
    static EXECUTOR: StaticCell<Executor> = StaticCell::new();

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("[MAIN] panic: {}", info);
        loop {}
    }

    // Embassy task to run the network stack
    #[embassy_executor::task]
    async fn net_task(
        mut runner: embassy_net::Runner<'static, esp_wifi::wifi::WifiDevice<'static>>,
    ) -> ! {
        runner.run().await
    }

    /// Cooperative loop driving the network subsystem
    #[embassy_executor::task]
    async fn wifi_task(subsystem: &'static FixtureSubsystem) -> ! {
        println!("[MAIN] Starting network subsystem");
        subsystem.set_up();

        loop {
            if let Err(error) = subsystem.work() {
                panic!("network subsystem halted: {}", error);
            }

            if subsystem.has_work() {
                embassy_futures::yield_now().await;
            } else {
                // Idle; callbacks and the verify timer are picked up on the next pass
                Timer::after(Duration::from_millis(10)).await;
            }
        }
    }

    /// Factory MAC address as the device's 64-bit hardware id
    fn hardware_id() -> u64 {
        Efuse::read_base_mac_address()
            .iter()
            .fold(0u64, |id, byte| (id << 8) | u64::from(*byte))
    }

    #[esp_hal::main]
    fn main() -> ! {
        let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
        let peripherals = esp_hal::init(config);

        // Initialize heap allocator for WiFi (72KB)
        esp_alloc::heap_allocator!(size: 72 * 1024);

        // Initialize embassy time system
        let timer_group0 = TimerGroup::new(peripherals.TIMG0);
        esp_hal_embassy::init(timer_group0.timer0);

        // Initialize WiFi driver
        let timer_group1 = TimerGroup::new(peripherals.TIMG1);
        let mut rng = Rng::new(peripherals.RNG);
        let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());
        let wifi_init = match esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK) {
            Ok(wifi_init) => wifi_init,
            Err(error) => panic!("WiFi driver init failed: {:?}", error),
        };
        println!("[WIFI] WiFi driver initialized successfully");

        // Store wifi_init in static cell for 'static lifetime
        let wifi_init_ref = WIFI_INIT_CELL.init(wifi_init);

        let (wifi_controller, wifi_interfaces) = match wifi::new(wifi_init_ref, peripherals.WIFI) {
            Ok(wifi) => wifi,
            Err(error) => panic!("WiFi controller creation failed: {:?}", error),
        };

        // Create embassy-net stack with DHCP configuration
        let stack_resources = STACK_RESOURCES.init(StackResources::new());
        let net_config = Config::dhcpv4(Default::default());
        let (stack, runner): (Stack<'static>, _) =
            embassy_net::new(wifi_interfaces.sta, net_config, stack_resources, seed);
        println!("[WIFI] Embassy-net stack created with DHCP configuration");

        let hardware_id = hardware_id();
        println!("[MAIN] Hardware id {:016X}", hardware_id);

        // Built in place; the session buffers are too large to move through the stack
        let subsystem: &'static FixtureSubsystem = SUBSYSTEM_CELL.init_with(|| {
            WifiSubsystem::new(
                EmbassyTransport::new(stack, &LINKS),
                StaticCredentials,
                hardware_id,
            )
        });

        // Initialize embassy executor and run tasks
        let executor = EXECUTOR.init(Executor::new());
        executor.run(|spawner| {
            println!("[MAIN] Spawning network task...");
            spawner.spawn(net_task(runner)).ok();

            println!("[MAIN] Spawning WiFi controller task...");
            spawner.spawn(controller_task(wifi_controller, &LINKS)).ok();

            println!("[MAIN] Spawning WiFi subsystem task...");
            spawner.spawn(wifi_task(subsystem)).ok();

            for slot in 0..SOCKET_SLOTS {
                if let Err(error) = spawner.spawn(socket_task(stack, subsystem, &LINKS, slot)) {
                    println!("[MAIN] Failed to spawn socket task {}: {:?}", slot, error);
                }
            }

            println!("[MAIN] Spawning mDNS task...");
            if let Err(error) = spawner.spawn(mdns_task(stack, &LINKS)) {
                println!("[MAIN] Failed to spawn mDNS task: {:?}", error);
            }
        });
    }
}

/// The firmware only runs on the ESP32-C3; host builds exist for the test suite.
#[cfg(not(target_arch = "riscv32"))]
fn main() {
    println!(
        "fixture-rs {}: build for riscv32imc-unknown-none-elf to get the firmware",
        fixture_rs::VERSION
    );
}
