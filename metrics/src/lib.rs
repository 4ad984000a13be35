use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;

pub fn init_provider() -> prometheus::Registry {
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build();
    let mut provider = SdkMeterProvider::builder();
    if let Ok(exporter) = exporter {
        provider = provider.with_reader(exporter);
    };
    opentelemetry::global::set_meter_provider(provider.build());
    registry
}

pub mod api_io_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub creates: Counter<u64>,
        pub updates: Counter<u64>,
        pub reads: Counter<u64>,
        pub deletes: Counter<u64>,
        pub ingested_bytes: Counter<u64>,
        pub served_bytes: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blobd-server");
            let creates = meter
                .u64_counter("blobd.server.creates")
                .with_description("number of blobs created")
                .build();
            let updates = meter
                .u64_counter("blobd.server.updates")
                .with_description("number of blob payloads replaced")
                .build();
            let reads = meter
                .u64_counter("blobd.server.reads")
                .with_description("number of blob payloads served")
                .build();
            let deletes = meter
                .u64_counter("blobd.server.deletes")
                .with_description("number of blobs deleted")
                .build();
            let ingested_bytes = meter
                .u64_counter("blobd.server.ingested_bytes")
                .with_description("number of payload bytes ingested by creates and updates")
                .build();
            let served_bytes = meter
                .u64_counter("blobd.server.served_bytes")
                .with_description("number of payload bytes streamed out by reads")
                .build();
            Metrics {
                creates,
                updates,
                reads,
                deletes,
                ingested_bytes,
                served_bytes,
            }
        }
    }
}

pub mod gc_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub runs: Counter<u64>,
        pub reclaimed: Counter<u64>,
        pub run_latency: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blobd-gc");

            let runs = meter
                .u64_counter("blobd.gc.runs")
                .with_description("number of collection passes")
                .build();

            let reclaimed = meter
                .u64_counter("blobd.gc.reclaimed")
                .with_description("number of blob directories reclaimed")
                .build();

            let run_latency = meter
                .f64_histogram("blobd.gc.run_latency")
                .with_description("collection pass latencies in seconds")
                .build();

            Metrics {
                runs,
                reclaimed,
                run_latency,
            }
        }
    }
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self {
            start: Instant::now(),
            metric,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &[]);
    }
}
