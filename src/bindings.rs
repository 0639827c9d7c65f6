//! Solidity ABI bindings for the yearn vault, the clonable Velodrome gauge
//! strategy and the third-party contracts it touches.
//!
//! Only the surface exercised by the scenarios is declared. The vault is a
//! Vyper contract whose default arguments show up as overloads, so
//! `withdraw` is split into `withdraw_0` (everything) and `withdraw_1`
//! (explicit shares, recipient and max loss).

use alloy::sol;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function approve(address spender, uint256 amount) external returns (bool);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

sol! {
    #[sol(rpc)]
    interface IGauge {
        function balanceOf(address account) external view returns (uint256);
        function earned(address token, address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

sol! {
    #[sol(rpc)]
    interface IGasOracle {
        function setMaxAcceptableBaseFee(uint256 maxAcceptableBaseFee) external;
    }
}

sol! {
    #[sol(rpc)]
    #[allow(clippy::too_many_arguments)]
    interface IVault {
        #[derive(Debug, PartialEq, Eq)]
        struct StrategyParams {
            uint256 performanceFee;
            uint256 activation;
            uint256 debtRatio;
            uint256 minDebtPerHarvest;
            uint256 maxDebtPerHarvest;
            uint256 lastReport;
            uint256 totalDebt;
            uint256 totalGain;
            uint256 totalLoss;
        }

        function initialize(
            address token,
            address governance,
            address rewards,
            string nameOverride,
            string symbolOverride,
            address guardian
        ) external;
        function setDepositLimit(uint256 limit) external;
        function setManagement(address management) external;
        function setManagementFee(uint256 fee) external;
        function addStrategy(
            address strategy,
            uint256 debtRatio,
            uint256 minDebtPerHarvest,
            uint256 maxDebtPerHarvest,
            uint256 performanceFee
        ) external;
        function updateStrategyDebtRatio(address strategy, uint256 debtRatio) external;
        function migrateStrategy(address oldVersion, address newVersion) external;
        function setWithdrawalQueue(address[20] queue) external;
        function withdrawalQueue(uint256 index) external view returns (address);
        function strategies(address strategy) external view returns (StrategyParams memory);

        function deposit(uint256 amount) external returns (uint256);
        function withdraw() external returns (uint256);
        function withdraw(uint256 maxShares, address recipient, uint256 maxLoss) external returns (uint256);

        function token() external view returns (address);
        function totalAssets() external view returns (uint256);
        function pricePerShare() external view returns (uint256);
    }
}

sol! {
    #[sol(rpc)]
    #[allow(clippy::too_many_arguments)]
    interface IStrategy {
        event Harvested(uint256 profit, uint256 loss, uint256 debtPayment, uint256 debtOutstanding);
        event Cloned(address indexed clone);

        function initialize(
            address vault,
            address strategist,
            address rewards,
            address keeper,
            address gauge,
            address pool,
            address other,
            address healthCheck,
            string name
        ) external;

        function want() external view returns (address);
        function vault() external view returns (address);
        function apiVersion() external pure returns (string);
        function isActive() external view returns (bool);
        function estimatedTotalAssets() external view returns (uint256);
        function stakedBalance() external view returns (uint256);
        function balanceOfWant() external view returns (uint256);
        function ethToWant(uint256 amount) external view returns (uint256);
        function rewardsTokens(uint256 index) external view returns (address);

        function harvest() external;
        function tend() external;
        function harvestTrigger(uint256 callCostInWei) external view returns (bool);
        function tendTrigger(uint256 callCostInWei) external view returns (bool);

        function setKeeper(address keeper) external;
        function setHealthCheck(address healthCheck) external;
        function setDoHealthCheck(bool doHealthCheck) external;
        function setMaxReportDelay(uint256 delay) external;
        function setMinReportDelay(uint256 delay) external;
        function setEmergencyExit() external;
        function updateRewardsTokens(address[] tokens) external;

        function migrate(address newStrategy) external;
        function withdraw(uint256 amountNeeded) external returns (uint256);
    }
}
