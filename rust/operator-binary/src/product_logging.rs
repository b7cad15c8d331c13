//! Log shipping configuration for node-group pods (§10 supplemented feature
//! 2): per-container log4j2 config plus optional Vector agent wiring,
//! written into the group's backing config object alongside the search
//! configuration blob.

use snafu::Snafu;
use stackable_operator::{
    builder::configmap::ConfigMapBuilder,
    kube::runtime::reflector::ObjectRef,
    product_logging::{
        self,
        spec::{ContainerLogConfig, ContainerLogConfigChoice, Logging},
    },
    role_utils::RoleGroupRef,
};

use crate::crd::{
    Container, MAX_SEARCH_LOG_FILES_SIZE_MIB, SEARCH_LOG4J2_PROPERTIES, STACKABLE_LOG_DIR,
    v1alpha1,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object has no namespace"))]
    ObjectHasNoNamespace,
}

type Result<T, E = Error> = std::result::Result<T, E>;

const CONSOLE_CONVERSION_PATTERN: &str = "%d{ISO8601} %5p [%t] %c{2}: %m%n";
const SEARCH_LOG_FILE: &str = "search.log4j2.xml";
const VECTOR_AGGREGATOR_ADDRESS: &str = "vector-aggregator-discovery:6123";

/// Extends a group's backing config object with the log4j2 config for the
/// main container and, if enabled, the Vector agent configuration.
pub fn extend_group_config_map(
    cluster: &v1alpha1::SearchCluster,
    group_name: &str,
    logging: &Logging<Container>,
    cm_builder: &mut ConfigMapBuilder,
) -> Result<()> {
    if let Some(ContainerLogConfig {
        choice: Some(ContainerLogConfigChoice::Automatic(log_config)),
    }) = logging.containers.get(&Container::Search)
    {
        cm_builder.add_data(
            SEARCH_LOG4J2_PROPERTIES,
            product_logging::framework::create_log4j2_config(
                &format!("{STACKABLE_LOG_DIR}/{container}", container = Container::Search),
                SEARCH_LOG_FILE,
                MAX_SEARCH_LOG_FILES_SIZE_MIB,
                CONSOLE_CONVERSION_PATTERN,
                log_config,
            ),
        );
    }

    let vector_log_config = if let Some(ContainerLogConfig {
        choice: Some(ContainerLogConfigChoice::Automatic(log_config)),
    }) = logging.containers.get(&Container::Vector)
    {
        Some(log_config)
    } else {
        None
    };

    if logging.enable_vector_agent {
        let group_ref = RoleGroupRef {
            cluster: ObjectRef::from_obj(cluster),
            role: "node".to_string(),
            role_group: group_name.to_string(),
        };
        cm_builder.add_data(
            product_logging::framework::VECTOR_CONFIG_FILE,
            product_logging::framework::create_vector_config(
                &group_ref,
                VECTOR_AGGREGATOR_ADDRESS,
                vector_log_config,
            ),
        );
    }

    Ok(())
}
