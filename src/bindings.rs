//! Solidity ABI bindings for the Liquidity Book pair and router, and
//! the ERC20 subset needed for approvals and balance deltas.

use alloy::sol;

sol! {
    #[derive(Debug)]
    interface ILBPair {
        function getActiveId() external view returns (uint24 activeId);
        function getBinStep() external pure returns (uint16 binStep);
        function getTokenX() external pure returns (address tokenX);
        function getTokenY() external pure returns (address tokenY);
        function balanceOfBatch(address[] calldata accounts, uint256[] calldata ids)
            external
            view
            returns (uint256[] memory batchBalances);
        function isApprovedForAll(address owner, address spender) external view returns (bool);
        function approveForAll(address spender, bool approved) external;
    }
}

sol! {
    #[derive(Debug)]
    interface ILBRouter {
        struct LiquidityParameters {
            address tokenX;
            address tokenY;
            uint256 binStep;
            uint256 amountX;
            uint256 amountY;
            uint256 amountXMin;
            uint256 amountYMin;
            uint256 activeIdDesired;
            uint256 idSlippage;
            int256[] deltaIds;
            uint256[] distributionX;
            uint256[] distributionY;
            address to;
            address refundTo;
            uint256 deadline;
        }

        function addLiquidity(LiquidityParameters calldata liquidityParameters)
            external
            returns (
                uint256 amountXAdded,
                uint256 amountYAdded,
                uint256 amountXLeft,
                uint256 amountYLeft,
                uint256[] memory depositIds,
                uint256[] memory liquidityMinted
            );

        function removeLiquidity(
            address tokenX,
            address tokenY,
            uint16 binStep,
            uint256 amountXMin,
            uint256 amountYMin,
            uint256[] memory ids,
            uint256[] memory amounts,
            address to,
            uint256 deadline
        ) external returns (uint256 amountX, uint256 amountY);
    }
}

sol! {
    #[derive(Debug)]
    interface IERC20 {
        function approve(address spender, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}
