use spark_transport::OperationKind;

pub(crate) const BIND: OperationKind =
    OperationKind::new("spark.transport.tcp.bind_failed", "tcp bind");
pub(crate) const ACCEPT: OperationKind =
    OperationKind::new("spark.transport.tcp.accept_failed", "tcp accept");
pub(crate) const CONNECT: OperationKind =
    OperationKind::new("spark.transport.tcp.connect_failed", "tcp connect");
pub(crate) const READ: OperationKind =
    OperationKind::new("spark.transport.tcp.read_failed", "tcp read");
pub(crate) const WRITE: OperationKind =
    OperationKind::new("spark.transport.tcp.write_failed", "tcp write");
pub(crate) const SHUTDOWN: OperationKind =
    OperationKind::new("spark.transport.tcp.shutdown_failed", "tcp shutdown");
pub(crate) const CONFIGURE: OperationKind =
    OperationKind::new("spark.transport.tcp.configure_failed", "tcp configure");
